//! Managed SSH key: generated locally once, authorized for root on every node
//!
//! After authorization the credential chain reaches every node as root with the
//! managed key first, so later phases never need sudo or the node password.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::StepOutcome;
use crate::channel::{shell_quote, CommandChannel};
use crate::{Error, Result};

fn public_key_path(private_key: &Path) -> PathBuf {
    let mut os = private_key.as_os_str().to_owned();
    os.push(".pub");
    PathBuf::from(os)
}

/// Make sure the managed key pair exists, generating it through `local` when
/// either half is missing, and return the public key line
pub async fn ensure_managed_key(local: &dyn CommandChannel, private_key: &Path) -> Result<String> {
    let public_key = public_key_path(private_key);
    let have_private = tokio::fs::try_exists(private_key).await?;
    let have_public = tokio::fs::try_exists(&public_key).await?;

    if !(have_private && have_public) {
        if have_private || have_public {
            warn!(key = %private_key.display(), "incomplete managed key pair, regenerating");
            let _ = tokio::fs::remove_file(private_key).await;
            let _ = tokio::fs::remove_file(&public_key).await;
        }
        if let Some(dir) = private_key.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        info!(key = %private_key.display(), "generating managed SSH key");
        let path = private_key.to_string_lossy();
        local
            .execute(&format!(
                "ssh-keygen -q -t rsa -b 4096 -N '' -C kubestrap -f {}",
                shell_quote(&path)
            ))
            .await?;
    }

    let line = tokio::fs::read_to_string(&public_key).await?;
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::validation(format!(
            "managed public key {} is empty",
            public_key.display()
        )));
    }
    Ok(line.to_string())
}

fn authorize_script(public_key: &str) -> String {
    let key = shell_quote(public_key);
    format!(
        "mkdir -p /root/.ssh && chmod 700 /root/.ssh && touch /root/.ssh/authorized_keys \
         && chmod 600 /root/.ssh/authorized_keys; \
         if grep -qxF {key} /root/.ssh/authorized_keys; then echo present; else \
         echo {key} >> /root/.ssh/authorized_keys; \
         if grep -qE '^PermitRootLogin[[:space:]]+no' /etc/ssh/sshd_config; then \
         sed -i 's/^PermitRootLogin.*/PermitRootLogin prohibit-password/' /etc/ssh/sshd_config \
         && (systemctl reload sshd 2>/dev/null || systemctl reload ssh); fi; \
         echo added; fi"
    )
}

/// Authorize `public_key` for root on the node behind `channel`
pub async fn authorize(channel: &dyn CommandChannel, public_key: &str) -> Result<StepOutcome> {
    let out = channel.execute(&authorize_script(public_key)).await?;
    if out.trim() == "present" {
        debug!(host = %channel.host(), "managed key already authorized");
        return Ok(StepOutcome::Skipped);
    }
    info!(host = %channel.host(), "authorized managed key for root");
    Ok(StepOutcome::Applied)
}
