//! Command-line configuration (C6's external interface, SPEC_FULL.md §4.10).

use clap::Parser;

/// Start the application launcher daemon for one booster type.
#[derive(Parser, Clone, Debug, PartialEq, Eq)]
#[clap(version, about)]
pub struct BoosterArgs {
    /// Short type tag for the booster this instance manages, e.g. "qt" or
    /// "generic". Selects the socket and PID file names.
    pub booster_type: String,

    /// Start in the boot mode: boosters are not pre-warmed and the respawn
    /// delay is forced to zero. Normal mode is restored by sending SIGUSR1.
    #[clap(short = 'b', long = "boot-mode")]
    pub boot_mode: bool,

    /// Daemonise: double-fork, detach from the session, write a PID file.
    #[clap(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// Enable verbose logging to stdout.
    #[clap(long)]
    pub debug: bool,

    /// Notify systemd with READY=1 once the first warm booster is forked.
    #[clap(long)]
    pub systemd: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_booster_type_and_flags() {
        let args = BoosterArgs::parse_from(["boosterd", "qt", "--boot-mode", "--daemon"]);
        assert_eq!(args.booster_type, "qt");
        assert!(args.boot_mode);
        assert!(args.daemon);
        assert!(!args.debug);
        assert!(!args.systemd);
    }

    #[test]
    fn rejects_unknown_flags() {
        let result = BoosterArgs::try_parse_from(["boosterd", "qt", "--bogus"]);
        assert!(result.is_err());
    }
}
