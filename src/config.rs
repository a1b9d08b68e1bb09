//! Process configuration, parsed from CLI flags with environment-variable
//! fallbacks, mirroring the teacher's `clap`-derived `Config`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "moliord", about = "Debian package build orchestrator")]
pub struct Config {
    /// Postgres connection string.
    #[arg(long, env = "MOLIOR_DATABASE_URL")]
    pub database_url: String,

    /// Directory under which each `SourceRepository`'s checkout lives.
    #[arg(long, env = "MOLIOR_REPOSITORIES_ROOT", default_value = "/var/lib/molior/repositories")]
    pub repositories_root: PathBuf,

    /// Directory under which per-build artifact trees live.
    #[arg(long, env = "MOLIOR_BUILDOUT_ROOT", default_value = "/var/lib/molior/buildout")]
    pub buildout_root: PathBuf,

    /// Caps concurrent `buildenv` construction. Zero or absent disables the cap.
    #[arg(long, env = "MOLIOR_MAX_PARALLEL_CHROOTS", default_value_t = 0)]
    pub max_parallel_chroots: i64,

    /// Tracing filter directive, e.g. `info` or `molior_core=debug,tower=info`.
    /// Overridden at runtime by the `RUST_LOG` environment variable if set.
    #[arg(long, env = "MOLIOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Name of the configured build-node backend. Only `static` (no real
    /// node discovery) ships with this core.
    #[arg(long, env = "MOLIOR_BACKEND", default_value = "static")]
    pub backend: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_required_args() {
        let cfg = Config::parse_from(["moliord", "--database-url", "postgres://localhost/molior"]);
        assert_eq!(cfg.database_url, "postgres://localhost/molior");
        assert_eq!(cfg.max_parallel_chroots, 0);
        assert_eq!(cfg.log_level, "info");
    }
}
