use crate::experiment::{ExperimentSummary, Verdict};
use crate::trial::{TrialOutcome, TrialStatus};
use std::io::{self, Write};

/// The byte as a character if it is printable ASCII, `?` otherwise.
pub fn printable(byte: u8) -> char {
    if (0x20..0x7f).contains(&byte) {
        byte as char
    } else {
        '?'
    }
}

pub fn write_outcome<W: Write>(w: &mut W, outcome: &TrialOutcome) -> io::Result<()> {
    let secret = outcome.secret_byte;
    writeln!(
        w,
        "Attempting to leak: {:#04x} ('{}')",
        secret,
        printable(secret)
    )?;
    match &outcome.status {
        TrialStatus::Completed {
            store_addr,
            load_addr,
            leaked_byte,
            confidence,
            success,
        } => {
            writeln!(
                w,
                "4K-aliased addresses: {:#x} and {:#x} (offset: {:#x})",
                store_addr,
                load_addr,
                store_addr & crate::alias::OFFSET_MASK
            )?;
            writeln!(
                w,
                "Leaked: {:#04x} ('{}'), confidence: {}",
                leaked_byte,
                printable(*leaked_byte),
                confidence
            )?;
            writeln!(w, "{}", if *success { "SUCCESS" } else { "FAILED" })?;
        }
        TrialStatus::Incomplete { reason } => {
            writeln!(w, "INCOMPLETE: {}", reason)?;
        }
    }
    writeln!(w)
}

pub fn write_text<W: Write>(w: &mut W, summary: &ExperimentSummary) -> io::Result<()> {
    writeln!(w, "=== 4K-Aliasing Speculative Forwarding Attack ===")?;
    writeln!(w)?;
    for outcome in &summary.outcomes {
        write_outcome(w, outcome)?;
    }
    writeln!(w, "=== Summary ===")?;
    writeln!(
        w,
        "Successful leaks: {} / {}",
        summary.succeeded, summary.attempted
    )?;
    if summary.incomplete > 0 {
        writeln!(w, "Incomplete trials: {}", summary.incomplete)?;
    }
    if summary.miss_faster_than_hit {
        writeln!(
            w,
            "Hit threshold: above {} cycles (misses faster than hits)",
            summary.threshold_cycles
        )?;
    } else {
        writeln!(w, "Hit threshold: at most {} cycles", summary.threshold_cycles)?;
    }
    for warning in &summary.warnings {
        writeln!(w, "Warning: {}", warning)?;
    }
    writeln!(w)?;
    match summary.verdict {
        Verdict::Vulnerable => {
            writeln!(w, "RESULT: Attack SUCCEEDED")?;
            writeln!(w, "Processor speculatively forwards based on 4K-aliasing")
        }
        Verdict::NotVulnerable => {
            writeln!(w, "RESULT: Attack FAILED")?;
            writeln!(
                w,
                "Processor does NOT speculatively forward based on 4K-aliasing"
            )
        }
    }
}

pub fn write_json<W: Write>(w: &mut W, summary: &ExperimentSummary) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *w, summary)?;
    writeln!(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrialConfig;
    use crate::experiment::Warning;

    fn summary() -> ExperimentSummary {
        ExperimentSummary::from_outcomes(
            vec![
                TrialOutcome {
                    secret_byte: 0x41,
                    status: TrialStatus::Completed {
                        store_addr: 0x7f00_0000_1100,
                        load_addr: 0x7f00_0000_5100,
                        leaked_byte: 0x41,
                        confidence: 78,
                        success: true,
                    },
                },
                TrialOutcome {
                    secret_byte: 0x7f,
                    status: TrialStatus::Completed {
                        store_addr: 0x7f00_0000_2100,
                        load_addr: 0x7f00_0000_6100,
                        leaked_byte: 0x00,
                        confidence: 1,
                        success: false,
                    },
                },
                TrialOutcome {
                    secret_byte: 0x42,
                    status: TrialStatus::Incomplete {
                        reason: "failed to map aliased page".to_string(),
                    },
                },
            ],
            &TrialConfig::default(),
        )
    }

    #[test]
    fn printable_ascii_only() {
        assert_eq!(printable(b'A'), 'A');
        assert_eq!(printable(b' '), ' ');
        assert_eq!(printable(b'~'), '~');
        assert_eq!(printable(0x7f), '?');
        assert_eq!(printable(0x1f), '?');
        assert_eq!(printable(0xff), '?');
    }

    #[test]
    fn text_report() {
        let mut out = Vec::new();
        write_text(&mut out, &summary()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Attempting to leak: 0x41 ('A')"));
        assert!(text.contains("(offset: 0x100)"));
        assert!(text.contains("Leaked: 0x41 ('A'), confidence: 78\nSUCCESS"));
        assert!(text.contains("Attempting to leak: 0x7f ('?')"));
        assert!(text.contains("Leaked: 0x00 ('?'), confidence: 1\nFAILED"));
        assert!(text.contains("INCOMPLETE: failed to map aliased page"));
        assert!(text.contains("Successful leaks: 1 / 3"));
        assert!(text.contains("Incomplete trials: 1"));
        assert!(text.contains("Hit threshold: at most 80 cycles"));
        assert!(text.contains("RESULT: Attack SUCCEEDED"));
    }

    #[test]
    fn failed_report_lists_warnings() {
        let mut s = summary();
        s.verdict = Verdict::NotVulnerable;
        s.warnings.push(Warning::Calibration { max_confidence: 1 });
        let mut out = Vec::new();
        write_text(&mut out, &s).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Warning: best confidence was 1"));
        assert!(text.contains("RESULT: Attack FAILED"));
    }

    #[test]
    fn inverted_threshold_is_reported() {
        let mut s = summary();
        s.threshold_cycles = 300;
        s.miss_faster_than_hit = true;
        let mut out = Vec::new();
        write_text(&mut out, &s).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Hit threshold: above 300 cycles (misses faster than hits)"));

        let mut out = Vec::new();
        write_json(&mut out, &s).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["miss_faster_than_hit"], true);
    }

    #[test]
    fn json_report() {
        let mut out = Vec::new();
        write_json(&mut out, &summary()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["attempted"], 3);
        assert_eq!(value["succeeded"], 1);
        assert_eq!(value["incomplete"], 1);
        assert_eq!(value["verdict"], "vulnerable");
        assert_eq!(value["threshold_cycles"], 80);
        assert_eq!(value["miss_faster_than_hit"], false);
        let outcomes = value["outcomes"].as_array().unwrap();
        assert_eq!(outcomes[0]["status"], "completed");
        assert_eq!(outcomes[0]["secret_byte"], 0x41);
        assert_eq!(outcomes[0]["confidence"], 78);
        assert_eq!(outcomes[0]["success"], true);
        assert_eq!(outcomes[2]["status"], "incomplete");
        assert!(value["warnings"].as_array().unwrap().is_empty());
    }
}
