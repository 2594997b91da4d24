use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use tracing::info;

use crate::shutdown::ShutdownSignal;
use crate::supervisor::StatsHandle;

/// Wires `TERM`/`INT`/`USR1`/`USR2` to the supervisor per §4.8 step 4.
/// `TERM`/`INT` set the global shutdown signal; `USR1` logs a stats
/// snapshot; `USR2` logs the current task backtrace stand-in (a full
/// stack dump has no portable async equivalent, so this emits the
/// supervisor's live state instead).
pub fn install(shutdown: ShutdownSignal, stats: StatsHandle) {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGUSR1, SIGUSR2]).expect("failed to install signal handlers");

    tokio::spawn(async move {
        for sig in signals.forever() {
            match sig {
                SIGINT | SIGTERM => {
                    info!(signal = sig, "received shutdown signal");
                    shutdown.set();
                }
                SIGUSR1 => {
                    let snapshot = stats.snapshot().await;
                    info!(?snapshot, "supervisor stats snapshot (USR1)");
                }
                SIGUSR2 => {
                    let snapshot = stats.snapshot().await;
                    info!(?snapshot, "USR2 received, dumping supervisor state in lieu of a native stack trace");
                }
                _ => {}
            }
        }
    });
}
