//! Tests for transport settings shared across sessions. Argument
//! construction is covered next to the session implementation; behaviour
//! against live hosts is covered by the scripted doubles in the scheduler
//! tests.

use crate::shell::SshSettings;
use crate::shell::ssh::expand_tilde;

#[test]
fn expand_tilde_uses_home() {
    let home = std::env::var("HOME").expect("HOME should be set in tests");
    assert_eq!(
        expand_tilde("~/.ssh/id_ed25519"),
        format!("{home}/.ssh/id_ed25519")
    );
    assert_eq!(expand_tilde("/abs/key"), "/abs/key");
}

#[test]
fn default_settings_prefer_prompt_free_operation() {
    let settings = SshSettings::default();
    assert_eq!(settings.ssh_bin, "ssh");
    assert!(settings.batch_mode);
    assert!(settings.strict_host_key_checking);
    assert!(settings.known_hosts_file.is_none());
    assert!(settings.identity_file.is_none());
}
