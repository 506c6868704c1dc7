fn main() {
    if let Some(code) = portcheck::cli::run_marker_mode() {
        std::process::exit(code);
    }
    if let Err(err) = portcheck::cli::run() {
        portcheck::ui::eprintln_error(&err);
        std::process::exit(portcheck::exit::exit_code(&err));
    }
}
