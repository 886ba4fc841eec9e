//! Minimal re-exec target for the job launcher.

fn main() {
    let mut args = std::env::args();
    if args.nth(1).as_deref() == Some(joblib::INIT_MARKER) {
        joblib::isolation::init::run(args);
    }
    eprintln!("jobinit is started by joblib, not by hand");
    std::process::exit(2);
}
