//! `install_package`: pip install into the kernel's interpreter

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use super::error_envelope;

/// Reject names pip would treat as options or several arguments
pub fn validate_package_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("package name is empty".to_string());
    }
    if name.chars().any(char::is_whitespace) {
        return Err(format!("invalid package name '{name}': contains whitespace"));
    }
    if name.starts_with('-') {
        return Err(format!("invalid package name '{name}': looks like an option"));
    }
    Ok(())
}

/// Run `<interpreter> -m pip install <package>` and wait for it
pub async fn install_package(interpreter: &str, package: &str, limit: Duration) -> Value {
    if let Err(e) = validate_package_name(package) {
        return error_envelope(e);
    }

    info!(interpreter, package, "installing package");
    let start = Instant::now();

    let mut cmd = Command::new(interpreter);
    cmd.args(["-m", "pip", "install", package])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
            if exit_code != 0 {
                warn!(package, exit_code, "package install failed");
            }
            json!({
                "status": if output.status.success() { "success" } else { "error" },
                "package": package,
                "exit_code": exit_code,
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
                "duration_ms": duration_ms,
            })
        }
        Ok(Err(e)) => error_envelope(format!("failed to run {interpreter}: {e}")),
        Err(_) => error_envelope(format!(
            "installing {package} timed out after {}s",
            limit.as_secs()
        )),
    }
}
