fn main() {
    if let Err(err) = ddct::cli::run() {
        ddct::ui::eprintln_error(&err);
        std::process::exit(ddct::exit::exit_code(&err));
    }
}
