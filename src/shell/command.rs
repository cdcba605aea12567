//! Remote command composition.
//!
//! A task command travels to the remote shell as one string of the shape
//! `<setup1> && <setup2> && cd <workdir> && export K1='v1'; export K2='v2';
//! <user command>`, every section optional. Values are always single-quoted
//! using the close-quote/escape/reopen sequence, which is the only encoding
//! POSIX shells agree on.

use std::collections::BTreeMap;

/// Wraps `value` in single quotes, escaping embedded quotes as `'\''`.
#[must_use]
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Normalises a configured remote directory for use inside quoted shell
/// fragments: a leading `~/` becomes a path relative to the login
/// directory, since quoting would otherwise defeat tilde expansion.
#[must_use]
pub fn remote_dir(dir: &str) -> String {
    if dir == "~" {
        return String::from(".");
    }
    dir.strip_prefix("~/").unwrap_or(dir).to_owned()
}

/// Composes the full command line for one task.
///
/// `setup` fragments and the `cd` into the working directory are joined with
/// `&&` so a failing preparation step aborts the task; environment exports
/// are statements of their own so the user command's exit code is the one
/// the shell reports.
#[must_use]
pub fn compose(
    setup: &[String],
    workdir: Option<&str>,
    env: &BTreeMap<String, String>,
    command: &str,
) -> String {
    let mut prefix: Vec<String> = setup.to_vec();
    if let Some(dir) = workdir {
        prefix.push(format!("cd {}", quote(dir)));
    }

    let mut tail = String::new();
    for (key, value) in env {
        tail.push_str(&format!("export {key}={}; ", quote(value)));
    }
    tail.push_str(command);

    if prefix.is_empty() {
        tail
    } else {
        format!("{} && {tail}", prefix.join(" && "))
    }
}
