fn main() {
    if let Err(err) = liss_harmonize::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
