//! Per-command counters and the `stat` TSV report (§4.H `stat`). Counters
//! are a flat array of atomics rather than per-worker blocks with a
//! replace-on-cancel handoff: the original's worker-restart-on-timeout
//! design doesn't have a direct analogue once workers are plain tokio
//! tasks (see the dispatcher module doc comment), so counters just live
//! on the shared server state and survive task churn for free.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::command::codes;

/// One slot per tracked command, plus three "miss" counters recovered
/// from the original stat table (`cnt_put_miss`, `cnt_out_miss`,
/// `cnt_get_miss`) that the distilled interface list omits.
#[derive(Debug, Default)]
pub struct Stats {
    put: AtomicU64,
    putkeep: AtomicU64,
    putcat: AtomicU64,
    putshl: AtomicU64,
    putnr: AtomicU64,
    out: AtomicU64,
    get: AtomicU64,
    mget: AtomicU64,
    vsiz: AtomicU64,
    iterinit: AtomicU64,
    iternext: AtomicU64,
    fwmkeys: AtomicU64,
    addint: AtomicU64,
    adddouble: AtomicU64,
    ext: AtomicU64,
    sync: AtomicU64,
    optimize: AtomicU64,
    vanish: AtomicU64,
    copy: AtomicU64,
    restore: AtomicU64,
    setmst: AtomicU64,
    rnum: AtomicU64,
    size: AtomicU64,
    stat: AtomicU64,
    misc: AtomicU64,
    repl: AtomicU64,
    put_miss: AtomicU64,
    out_miss: AtomicU64,
    get_miss: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, cmd_byte: u8) -> Option<&AtomicU64> {
        Some(match cmd_byte {
            codes::PUT => &self.put,
            codes::PUTKEEP => &self.putkeep,
            codes::PUTCAT => &self.putcat,
            codes::PUTSHL => &self.putshl,
            codes::PUTNR => &self.putnr,
            codes::OUT => &self.out,
            codes::GET => &self.get,
            codes::MGET => &self.mget,
            codes::VSIZ => &self.vsiz,
            codes::ITERINIT => &self.iterinit,
            codes::ITERNEXT => &self.iternext,
            codes::FWMKEYS => &self.fwmkeys,
            codes::ADDINT => &self.addint,
            codes::ADDDOUBLE => &self.adddouble,
            codes::EXT => &self.ext,
            codes::SYNC => &self.sync,
            codes::OPTIMIZE => &self.optimize,
            codes::VANISH => &self.vanish,
            codes::COPY => &self.copy,
            codes::RESTORE => &self.restore,
            codes::SETMST => &self.setmst,
            codes::RNUM => &self.rnum,
            codes::SIZE => &self.size,
            codes::STAT => &self.stat,
            codes::MISC => &self.misc,
            codes::REPL => &self.repl,
            _ => return None,
        })
    }

    pub fn record(&self, cmd_byte: u8) {
        if let Some(counter) = self.counter(cmd_byte) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_put_miss(&self) {
        self.put_miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_miss(&self) {
        self.out_miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_miss(&self) {
        self.get_miss.fetch_add(1, Ordering::Relaxed);
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Fields the `stat` command reports about the server as a whole, gathered
/// by the caller (dispatcher/app state) since `Stats` itself only tracks
/// counters.
pub struct ServerSnapshot<'a> {
    pub version: &'a str,
    pub start_time: Instant,
    pub pid: u32,
    pub sid: u16,
    pub db_type: &'a str,
    pub db_path: &'a str,
    pub rnum: u64,
    pub size: u64,
    pub replication: Option<ReplicationSnapshot<'a>>,
}

pub struct ReplicationSnapshot<'a> {
    pub master_host: &'a str,
    pub master_port: u16,
    pub rts_micros: u64,
}

/// Renders the `key\tvalue\n` TSV body `stat` sends back, ending with a
/// blank line as the original's line-oriented responses do.
pub fn render_tsv(snapshot: &ServerSnapshot<'_>, stats: &Stats) -> String {
    let mut out = String::new();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    let _ = writeln!(out, "version\t{}", snapshot.version);
    let _ = writeln!(out, "libver\t1");
    let _ = writeln!(out, "protver\t0.91");
    let _ = writeln!(out, "os\t{}", std::env::consts::OS);
    let _ = writeln!(out, "time\t{now:.6}");
    let _ = writeln!(out, "pid\t{}", snapshot.pid);
    let _ = writeln!(out, "sid\t{}", snapshot.sid);
    let _ = writeln!(out, "type\t{}", snapshot.db_type);
    let _ = writeln!(out, "path\t{}", snapshot.db_path);
    let _ = writeln!(out, "rnum\t{}", snapshot.rnum);
    let _ = writeln!(out, "size\t{}", snapshot.size);
    let _ = writeln!(out, "bigend\t1");
    if let Some(repl) = &snapshot.replication {
        let _ = writeln!(out, "mhost\t{}", repl.master_host);
        let _ = writeln!(out, "mport\t{}", repl.master_port);
        let _ = writeln!(out, "rts\t{}", repl.rts_micros);
        let delay = (now - repl.rts_micros as f64 / 1_000_000.0).max(0.0);
        let _ = writeln!(out, "delay\t{delay:.6}");
    }
    let _ = writeln!(out, "loadavg\t{:.6}", read_loadavg());
    if let Some((memsize, memrss)) = read_proc_self_mem() {
        let _ = writeln!(out, "memsize\t{memsize}");
        let _ = writeln!(out, "memrss\t{memrss}");
    }
    let _ = writeln!(out, "ru_real\t{:.6}", snapshot.start_time.elapsed().as_secs_f64());

    let _ = writeln!(out, "cnt_put\t{}", Stats::load(&stats.put));
    let _ = writeln!(out, "cnt_putkeep\t{}", Stats::load(&stats.putkeep));
    let _ = writeln!(out, "cnt_putcat\t{}", Stats::load(&stats.putcat));
    let _ = writeln!(out, "cnt_putshl\t{}", Stats::load(&stats.putshl));
    let _ = writeln!(out, "cnt_putnr\t{}", Stats::load(&stats.putnr));
    let _ = writeln!(out, "cnt_out\t{}", Stats::load(&stats.out));
    let _ = writeln!(out, "cnt_get\t{}", Stats::load(&stats.get));
    let _ = writeln!(out, "cnt_mget\t{}", Stats::load(&stats.mget));
    let _ = writeln!(out, "cnt_vsiz\t{}", Stats::load(&stats.vsiz));
    let _ = writeln!(out, "cnt_iterinit\t{}", Stats::load(&stats.iterinit));
    let _ = writeln!(out, "cnt_iternext\t{}", Stats::load(&stats.iternext));
    let _ = writeln!(out, "cnt_fwmkeys\t{}", Stats::load(&stats.fwmkeys));
    let _ = writeln!(out, "cnt_addint\t{}", Stats::load(&stats.addint));
    let _ = writeln!(out, "cnt_adddouble\t{}", Stats::load(&stats.adddouble));
    let _ = writeln!(out, "cnt_ext\t{}", Stats::load(&stats.ext));
    let _ = writeln!(out, "cnt_sync\t{}", Stats::load(&stats.sync));
    let _ = writeln!(out, "cnt_optimize\t{}", Stats::load(&stats.optimize));
    let _ = writeln!(out, "cnt_vanish\t{}", Stats::load(&stats.vanish));
    let _ = writeln!(out, "cnt_copy\t{}", Stats::load(&stats.copy));
    let _ = writeln!(out, "cnt_restore\t{}", Stats::load(&stats.restore));
    let _ = writeln!(out, "cnt_setmst\t{}", Stats::load(&stats.setmst));
    let _ = writeln!(out, "cnt_rnum\t{}", Stats::load(&stats.rnum));
    let _ = writeln!(out, "cnt_size\t{}", Stats::load(&stats.size));
    let _ = writeln!(out, "cnt_stat\t{}", Stats::load(&stats.stat));
    let _ = writeln!(out, "cnt_misc\t{}", Stats::load(&stats.misc));
    let _ = writeln!(out, "cnt_repl\t{}", Stats::load(&stats.repl));
    let _ = writeln!(out, "cnt_put_miss\t{}", Stats::load(&stats.put_miss));
    let _ = writeln!(out, "cnt_out_miss\t{}", Stats::load(&stats.out_miss));
    let _ = writeln!(out, "cnt_get_miss\t{}", Stats::load(&stats.get_miss));
    out
}

/// Best-effort one-minute load average from `/proc/loadavg`; `0.0` on any
/// platform or read failure rather than failing the `stat` command.
fn read_loadavg() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().map(str::to_string))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Best-effort `(VmSize, VmRSS)` in bytes from `/proc/self/status`.
fn read_proc_self_mem() -> Option<(u64, u64)> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let mut size = None;
    let mut rss = None;
    for line in status.lines() {
        if let Some(kb) = line.strip_prefix("VmSize:") {
            size = kb.trim().split_whitespace().next().and_then(|v| v.parse::<u64>().ok()).map(|v| v * 1024);
        } else if let Some(kb) = line.strip_prefix("VmRSS:") {
            rss = kb.trim().split_whitespace().next().and_then(|v| v.parse::<u64>().ok()).map(|v| v * 1024);
        }
    }
    Some((size?, rss?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_increments_the_matching_counter_only() {
        let stats = Stats::new();
        stats.record(codes::PUT);
        stats.record(codes::PUT);
        stats.record(codes::GET);
        assert_eq!(Stats::load(&stats.put), 2);
        assert_eq!(Stats::load(&stats.get), 1);
        assert_eq!(Stats::load(&stats.out), 0);
    }

    #[test]
    fn render_tsv_includes_counters_and_identity_fields() {
        let stats = Stats::new();
        stats.record(codes::PUT);
        stats.record_get_miss();
        let snapshot = ServerSnapshot {
            version: "1.0.0",
            start_time: Instant::now(),
            pid: 1234,
            sid: 7,
            db_type: "on-memory hash",
            db_path: "*",
            rnum: 3,
            size: 42,
            replication: None,
        };
        let tsv = render_tsv(&snapshot, &stats);
        assert!(tsv.contains("sid\t7\n"));
        assert!(tsv.contains("cnt_put\t1\n"));
        assert!(tsv.contains("cnt_get_miss\t1\n"));
        assert!(!tsv.contains("mhost"));
    }

    #[test]
    fn render_tsv_includes_replication_fields_when_replicating() {
        let stats = Stats::new();
        let snapshot = ServerSnapshot {
            version: "1.0.0",
            start_time: Instant::now(),
            pid: 1,
            sid: 2,
            db_type: "on-memory hash",
            db_path: "*",
            rnum: 0,
            size: 0,
            replication: Some(ReplicationSnapshot {
                master_host: "master.example",
                master_port: 1978,
                rts_micros: 0,
            }),
        };
        let tsv = render_tsv(&snapshot, &stats);
        assert!(tsv.contains("mhost\tmaster.example\n"));
        assert!(tsv.contains("mport\t1978\n"));
    }
}
