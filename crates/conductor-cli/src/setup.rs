//! Configuration loading and orchestrator wiring shared by the subcommands.

use std::sync::Arc;

use anyhow::Context as _;
use tracing::{debug, warn};

use conductor_core::Config;
use conductor_core::config::load_config;
use conductor_runner::breaker::BreakerRegistry;
use conductor_runner::orchestration::Orchestrator;
use conductor_runner::session::SessionStore;
use conductor_runner::subprocess::Interrupt;

use crate::cli::Cli;

/// Resolved configuration plus the objects built from it.
pub struct Context {
    pub config: Config,
    /// Shared by every orchestrator built here and the signal listener in main.
    pub interrupt: Interrupt,
}

impl Context {
    /// Load configuration layers and apply global CLI overrides.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine working directory")?;
        let mut config = load_config(Some(&cwd), cli.config.as_deref())?;
        if let Some(secs) = cli.timeout {
            config.orchestration.command_timeout_secs = secs;
        }
        debug!(?config, "Configuration resolved");
        Ok(Self {
            config,
            interrupt: Interrupt::new(),
        })
    }

    /// The session store, required by the caller.
    pub fn store(&self) -> anyhow::Result<SessionStore> {
        SessionStore::from_config(&self.config).context("Failed to open session store")
    }

    /// An orchestrator with breakers and, when available, session recording.
    pub fn orchestrator(&self) -> Orchestrator {
        let orchestrator = Orchestrator::from_config(&self.config)
            .with_breakers(Arc::new(BreakerRegistry::from_config(&self.config)))
            .with_interrupt(self.interrupt.clone());
        match SessionStore::from_config(&self.config) {
            Ok(store) => orchestrator.with_sessions(store),
            Err(e) => {
                warn!(error = %e, "Session store unavailable, runs will not be recorded");
                orchestrator
            }
        }
    }
}
