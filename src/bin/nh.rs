fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = nano_history::parse_cli();
    match nano_history::run(&cli) {
        Ok(()) => Ok(()),
        Err(err) => {
            let exit_code = nano_history::exit_code_for_error(&err);
            nano_history::write_cli_error(&err, std::io::stderr().lock())?;
            std::process::exit(exit_code);
        }
    }
}
