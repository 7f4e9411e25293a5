//! Process entry point (§10.2): parses argv into `Params`, installs
//! logging, and assembles the engine's `EngineConfig`. The south-bound
//! database connection and flow-sink wiring are out of scope (§6 names
//! only the trait contracts); the chassis-specific connector that
//! implements them is not part of this crate.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use compact_str::CompactString;
use flexi_logger::{FileSpec, Logger};
use lpft_core::TableMap;
use lpft_engine::EngineConfig;
use lpft_expr::HaGroupResolver;
use log::info;

/// No south-bound HA-group view is wired up yet; every port resolves as
/// not chassis-redirected until a real connector replaces this.
struct NoHaGroups;

impl HaGroupResolver for NoHaGroups {
    fn active_chassis(&self, _ha_group: &str) -> Option<&str> {
        None
    }
}

#[derive(Parser)]
#[command(version, about)]
struct Params {
    /// enable logging and put the log in the specified directory. You
    /// should also set the RUST_LOG environment variable, e.g. RUST_LOG=debug
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// this chassis's name, as it appears in PortBinding.chassis and
    /// HA-group active-chassis fields
    #[arg(long)]
    chassis: String,
    /// emit the legacy ct_label.natted hairpin-detection flow alongside
    /// ct_mark.natted for every load balancer
    #[arg(long)]
    lb_legacy_ct_label_compat: bool,
    /// soft byte budget for the lflow cache
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    cache_byte_budget: usize,
}

impl Params {
    fn into_engine_config(self) -> EngineConfig {
        EngineConfig {
            chassis: CompactString::from(self.chassis),
            lb_legacy_ct_label_compat: self.lb_legacy_ct_label_compat,
            cache_byte_budget: self.cache_byte_budget,
            tables: TableMap::default(),
        }
    }
}

fn main() -> Result<()> {
    let p = Params::parse();
    if let Some(dir) = &p.log_dir {
        let _ = Logger::try_with_env()
            .context("initializing log")?
            .log_to_file(FileSpec::default().directory(dir).basename("lpft").use_timestamp(false))
            .start()
            .context("starting log")?;
    } else {
        let _ = Logger::try_with_env().context("initializing log")?.start().context("starting log")?;
    }

    info!("logical-to-physical flow translator starting, chassis={}", p.chassis);
    let config = p.into_engine_config();
    let _engine = lpft_engine::Engine::new(config, NoHaGroups);
    info!("engine constructed; awaiting south-bound connector wiring");
    Ok(())
}
