//! Command-line surface (§6 "CLI surface (ttserver)"): one flag per
//! documented option, plus the positional database spec string. `-skel`,
//! `-ext`, `-extpc`, and `-mul` are parsed and carried in [`Config`] but
//! the skeleton-DB loader, scripting extension, and multi-database split
//! they configure are out of scope (§1) — they're accepted so a real
//! deployment's command line doesn't fail to parse, not wired to behavior.

use std::path::PathBuf;

use clap::Parser;

use crate::mask::CommandMask;

#[derive(Parser, Debug, Clone)]
#[command(name = "ttserver", about = "Networked front-end for an embedded key/value store")]
pub struct Args {
    /// Database spec string (e.g. `*` for the in-memory hash database).
    pub dbspec: String,

    #[arg(long = "host", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long = "port", default_value_t = 1978)]
    pub port: u16,

    #[arg(long = "thnum", default_value_t = 8)]
    pub thnum: usize,

    #[arg(long = "tout", default_value_t = 0)]
    pub tout: u64,

    /// Daemonize after startup.
    #[arg(long = "dmn")]
    pub dmn: bool,

    #[arg(long = "pid")]
    pub pid: Option<PathBuf>,

    /// Kill a predecessor instance found via the pid file before starting.
    #[arg(long = "kl")]
    pub kl: bool,

    #[arg(long = "log")]
    pub log: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(long = "ld")]
    pub ld: bool,

    /// Error-level-only logging.
    #[arg(long = "le")]
    pub le: bool,

    #[arg(long = "ulog")]
    pub ulog: Option<PathBuf>,

    #[arg(long = "ulim", default_value_t = 256 * 1024 * 1024)]
    pub ulim: u64,

    /// Use background periodic fsync instead of sync-per-append.
    #[arg(long = "uas")]
    pub uas: bool,

    #[arg(long = "sid", default_value_t = 0)]
    pub sid: u16,

    #[arg(long = "mhost")]
    pub mhost: Option<String>,

    #[arg(long = "mport", default_value_t = 1978)]
    pub mport: u16,

    #[arg(long = "rts")]
    pub rts: Option<PathBuf>,

    /// Treat a redo consistency mismatch as fatal.
    #[arg(long = "rcc")]
    pub rcc: bool,

    /// Skeleton-DB loader path. Accepted for command-line compatibility;
    /// the skeleton-DB loader itself is out of scope.
    #[arg(long = "skel")]
    pub skel: Option<PathBuf>,

    /// Number of split multi-databases. Accepted for compatibility; this
    /// server always runs a single database.
    #[arg(long = "mul", default_value_t = 1)]
    pub mul: u32,

    /// Scripting extension path. Accepted for compatibility; the
    /// extension is modeled only as an opaque handle (see [`crate::ext`]).
    #[arg(long = "ext")]
    pub ext: Option<PathBuf>,

    /// Periodic extension call, `name period`. Accepted for compatibility.
    #[arg(long = "extpc", num_args = 2, value_names = ["name", "period"])]
    pub extpc: Option<Vec<String>>,

    #[arg(long = "mask")]
    pub mask: Option<String>,

    #[arg(long = "unmask")]
    pub unmask: Option<String>,
}

/// The resolved runtime configuration built from [`Args`].
#[derive(Debug, Clone)]
pub struct Config {
    pub dbspec: String,
    pub host: String,
    pub port: u16,
    pub thnum: usize,
    pub tout_secs: u64,
    pub daemonize: bool,
    pub pid_path: Option<PathBuf>,
    pub kill_predecessor: bool,
    pub log_path: Option<PathBuf>,
    pub log_level: LogLevel,
    pub ulog_dir: Option<PathBuf>,
    pub ulog_limit: u64,
    pub ulog_async: bool,
    pub sid: u16,
    pub master_host: Option<String>,
    pub master_port: u16,
    pub rts_path: Option<PathBuf>,
    pub strict_consistency: bool,
    pub mask: CommandMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        let log_level = if args.ld {
            LogLevel::Debug
        } else if args.le {
            LogLevel::Error
        } else {
            LogLevel::Info
        };

        let mut mask = CommandMask::allow_all();
        if let Some(expr) = &args.mask {
            mask.mask(expr);
        }
        if let Some(expr) = &args.unmask {
            mask.unmask(expr);
        }

        let rts_path = args.rts.clone().or_else(|| {
            args.ulog
                .as_ref()
                .map(|dir| dir.join("ttserver.rts"))
        });

        Config {
            dbspec: args.dbspec,
            host: args.host,
            port: args.port,
            thnum: args.thnum,
            tout_secs: args.tout,
            daemonize: args.dmn,
            pid_path: args.pid,
            kill_predecessor: args.kl,
            log_path: args.log,
            log_level,
            ulog_dir: args.ulog,
            ulog_limit: args.ulim,
            ulog_async: args.uas,
            sid: args.sid,
            master_host: args.mhost,
            master_port: args.mport,
            rts_path,
            strict_consistency: args.rcc,
            mask,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_just_the_dbspec() {
        let args = Args::parse_from(["ttserver", "*"]);
        assert_eq!(args.dbspec, "*");
        assert_eq!(args.port, 1978);
        assert_eq!(args.thnum, 8);
    }

    #[test]
    fn rts_path_defaults_under_the_ulog_directory() {
        let args = Args::parse_from(["ttserver", "*", "--ulog", "/var/tt/ulog"]);
        let config: Config = args.into();
        assert_eq!(config.rts_path, Some(PathBuf::from("/var/tt/ulog/ttserver.rts")));
    }

    #[test]
    fn explicit_rts_overrides_the_ulog_derived_default() {
        let args = Args::parse_from(["ttserver", "*", "--ulog", "/var/tt/ulog", "--rts", "/var/tt/custom.rts"]);
        let config: Config = args.into();
        assert_eq!(config.rts_path, Some(PathBuf::from("/var/tt/custom.rts")));
    }
}
