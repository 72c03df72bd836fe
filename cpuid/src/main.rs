use cpuid::{FamilyModelStepping, Features};

fn main() {
    println!("{}", FamilyModelStepping::get());
    let features = Features::detect();
    println!("{}", features);
    let missing = features.missing_for_timing();
    if !missing.is_empty() {
        println!("missing for cache timing: {:?}", missing);
    }
}
