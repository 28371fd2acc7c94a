//! Logging setup for the generator process.
//!
//! The generator is spawned by the pool supervisor, which often runs under
//! systemd. [`init`] installs a journald subscriber when a journal stream is
//! attached and a compact stdout subscriber otherwise. Modules pull in
//! `use crate::tracing::prelude::*` for the level macros.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Install the process-wide subscriber.
///
/// systemd sets JOURNAL_STREAM when stdout is connected to the journal; in
/// that case journald gets structured records directly. Anywhere else the
/// log goes to stdout, filtered by RUST_LOG with INFO as the default floor.
pub fn init() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry().with(layer).init();
                return;
            }
            Err(e) => {
                init_stdout();
                error!(error = %e, "journald unavailable, logging to stdout");
                return;
            }
        }
    }
    init_stdout();
}

fn init_stdout() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(ClockTimer))
        .init();
}

// Wall-clock timestamps to the second. Supervisor logs interleave several
// processes, so the short local form beats the default UTC string.
struct ClockTimer;

impl FormatTime for ClockTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        write!(
            w,
            "{:02}:{:02}:{:02}",
            now.hour(),
            now.minute(),
            now.second()
        )
    }
}
