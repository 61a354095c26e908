// Queue name grammar, the reserved session alias, and generated unique names.
use crate::core::error::{Error, ErrorKind};

/// Queue names are bounded to MAX_QUEUE_NAME - 1 bytes so a NUL-terminated
/// copy always fits a fixed MAX_QUEUE_NAME-byte field.
pub const MAX_QUEUE_NAME: usize = 63;

/// Alias addressing the per-process session queue; never a valid named queue.
pub const SESSION_ALIAS: &str = "SESSION";

/// Macro names are persisted into a fixed 256-byte descriptor field.
pub const MAX_MACRO_NAME: usize = 255;

pub fn validate_queue_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_QUEUE_NAME - 1 {
        return Err(Error::new(ErrorKind::BadArgument)
            .with_message(format!("queue name must be 1..={} bytes", MAX_QUEUE_NAME - 1)));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'?' | b'!' | b'_'))
    {
        return Err(Error::new(ErrorKind::BadArgument)
            .with_message("queue name may only contain [A-Za-z0-9.?!_]"));
    }
    if name.eq_ignore_ascii_case(SESSION_ALIAS) {
        return Err(Error::new(ErrorKind::BadArgument)
            .with_message("queue name collides with the session alias"));
    }
    Ok(())
}

pub fn validate_macro_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_MACRO_NAME {
        return Err(Error::new(ErrorKind::BadArgument)
            .with_message(format!("macro name must be 1..={MAX_MACRO_NAME} bytes")));
    }
    if name.bytes().any(|b| b == 0) {
        return Err(
            Error::new(ErrorKind::BadArgument).with_message("macro name must not contain NUL")
        );
    }
    Ok(())
}

/// Manufacture a fresh queue name for duplicate-create collisions. The caller
/// retries until the name is unused; the grammar always holds by construction.
pub fn generated_queue_name() -> Result<String, Error> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("random name generation failed")
            .with_source(err)
    })?;
    let mut name = String::with_capacity(17);
    name.push('Q');
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(name, "{byte:02X}");
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::{
        MAX_QUEUE_NAME, generated_queue_name, validate_macro_name, validate_queue_name,
    };
    use crate::core::error::ErrorKind;

    #[test]
    fn grammar_accepts_full_alphabet() {
        validate_queue_name("Work.item_9?done!").expect("valid name");
        validate_queue_name("a").expect("single char");
        validate_queue_name(&"x".repeat(MAX_QUEUE_NAME - 1)).expect("max length");
    }

    #[test]
    fn grammar_rejects_bad_names() {
        for name in ["", "has space", "tab\there", "slash/y", "sémaphore"] {
            let err = validate_queue_name(name).expect_err("should fail");
            assert_eq!(err.kind(), ErrorKind::BadArgument, "name: {name:?}");
        }
        let err = validate_queue_name(&"x".repeat(MAX_QUEUE_NAME)).expect_err("too long");
        assert_eq!(err.kind(), ErrorKind::BadArgument);
    }

    #[test]
    fn session_alias_is_reserved_case_insensitively() {
        for name in ["SESSION", "session", "SeSsIoN"] {
            let err = validate_queue_name(name).expect_err("reserved");
            assert_eq!(err.kind(), ErrorKind::BadArgument);
        }
        validate_queue_name("SESSIONS").expect("longer name is fine");
    }

    #[test]
    fn generated_names_satisfy_grammar_and_differ() {
        let first = generated_queue_name().expect("generate");
        let second = generated_queue_name().expect("generate");
        validate_queue_name(&first).expect("valid");
        validate_queue_name(&second).expect("valid");
        assert_ne!(first, second);
    }

    #[test]
    fn macro_name_bounds() {
        validate_macro_name("Greeting").expect("valid");
        validate_macro_name(&"m".repeat(255)).expect("max length");
        assert_eq!(
            validate_macro_name("").expect_err("empty").kind(),
            ErrorKind::BadArgument
        );
        assert_eq!(
            validate_macro_name(&"m".repeat(256)).expect_err("long").kind(),
            ErrorKind::BadArgument
        );
        assert_eq!(
            validate_macro_name("nul\0byte").expect_err("nul").kind(),
            ErrorKind::BadArgument
        );
    }
}
