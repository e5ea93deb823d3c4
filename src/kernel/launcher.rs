//! Kernel startup with a single fallback interpreter

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::session::{KernelSession, SETUP_CODE};
use super::KernelError;
use crate::config::KernelConfig;
use crate::metrics::KERNEL_STARTS;

/// Produces ready-to-use kernel sessions
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    async fn launch(&self) -> Result<KernelSession, KernelError>;
}

/// Launches local interpreter processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    interpreter: String,
    fallback: Option<String>,
    ready_timeout: Duration,
    setup_code: String,
}

impl ProcessLauncher {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            fallback: config
                .fallback_interpreter
                .clone()
                .filter(|f| f != &config.interpreter),
            ready_timeout: config.ready_timeout(),
            setup_code: config
                .setup_code
                .clone()
                .unwrap_or_else(|| SETUP_CODE.to_string()),
        }
    }

    async fn start(&self, interpreter: &str) -> Result<KernelSession, KernelError> {
        let session = KernelSession::spawn(interpreter)?;
        if let Err(e) = session.wait_for_ready(self.ready_timeout).await {
            let _ = session.shutdown().await;
            return Err(e);
        }
        // Setup may import matplotlib, which is slow on a cold cache
        session
            .run_setup(&self.setup_code, self.ready_timeout * 3)
            .await?;
        Ok(session)
    }
}

#[async_trait]
impl KernelLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<KernelSession, KernelError> {
        let primary_err = match self.start(&self.interpreter).await {
            Ok(session) => {
                KERNEL_STARTS
                    .with_label_values(&[&self.interpreter, "success"])
                    .inc();
                return Ok(session);
            }
            Err(e) => e,
        };
        KERNEL_STARTS
            .with_label_values(&[&self.interpreter, "failure"])
            .inc();

        let Some(fallback) = &self.fallback else {
            return Err(KernelError::Startup {
                interpreter: self.interpreter.clone(),
                reason: primary_err.to_string(),
            });
        };

        warn!(
            interpreter = %self.interpreter,
            fallback = %fallback,
            error = %primary_err,
            "kernel failed to start, trying fallback"
        );

        match self.start(fallback).await {
            Ok(session) => {
                KERNEL_STARTS.with_label_values(&[fallback, "success"]).inc();
                info!(interpreter = %fallback, "fallback kernel started");
                Ok(session)
            }
            Err(fallback_err) => {
                KERNEL_STARTS.with_label_values(&[fallback, "failure"]).inc();
                Err(KernelError::Startup {
                    interpreter: self.interpreter.clone(),
                    reason: format!("{primary_err}; fallback {fallback}: {fallback_err}"),
                })
            }
        }
    }
}
