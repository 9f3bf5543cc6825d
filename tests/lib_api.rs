use std::io::{Error, ErrorKind, Write};

#[test]
fn command_factory_returns_nh() {
    let cmd = nano_history::command();
    assert_eq!(cmd.get_name(), "nh");
}

#[test]
fn write_cli_error_renders_chain() -> color_eyre::Result<()> {
    let err = color_eyre::eyre::eyre!("root")
        .wrap_err("middle")
        .wrap_err("top");
    let mut output = Vec::new();
    nano_history::write_cli_error(&err, &mut output)?;
    let text = String::from_utf8(output)?;
    assert!(text.starts_with("nh: top\n"));
    assert!(text.contains("caused by: middle"));
    assert!(text.contains("caused by: root"));
    Ok(())
}

struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(Error::new(ErrorKind::BrokenPipe, "boom"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn write_cli_error_propagates_writer_failure() {
    let err = color_eyre::eyre::eyre!("root");
    let write_err = nano_history::write_cli_error(&err, FailingWriter).unwrap_err();
    assert_eq!(write_err.kind(), ErrorKind::BrokenPipe);
}

#[test]
fn store_errors_keep_their_exit_codes_through_context() {
    use color_eyre::eyre::WrapErr;

    let err = Err::<(), _>(nano_history::StoreError::DuplicateName("john".into()))
        .wrap_err("session create failed")
        .unwrap_err();
    assert_eq!(nano_history::exit_code_for_error(&err), 4);
}
