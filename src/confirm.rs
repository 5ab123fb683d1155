//! Operator confirmation gates
//!
//! Two strengths exist. An ordinary confirmation accepts `y`/`yes` and treats an
//! empty answer as yes. A dangerous confirmation, used before destroying a
//! control plane, accepts only the exact word `yes`.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::Mutex;

use crate::context::CommandContext;
use crate::Result;

/// Token a dangerous confirmation must be answered with
pub const DANGEROUS_TOKEN: &str = "yes";

/// Asks the operator before side effects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Ordinary yes/no question
    async fn confirm(&self, prompt: &str) -> Result<bool>;

    /// Question guarding a destructive action
    async fn confirm_dangerous(&self, prompt: &str) -> Result<bool>;
}

/// True for an ordinary affirmative answer; empty means yes
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim(), "" | "y" | "Y" | "yes" | "Yes" | "YES")
}

/// True only for the literal dangerous token
pub fn is_dangerous_affirmative(answer: &str) -> bool {
    answer.trim() == DANGEROUS_TOKEN
}

/// Reads answers line by line from a reader, prompting on stderr
pub struct LineConfirmer<R> {
    reader: Mutex<R>,
}

impl LineConfirmer<BufReader<Stdin>> {
    /// Confirmer reading the process's standard input
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> LineConfirmer<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    /// Confirmer reading from `reader`
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(reader),
        }
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        let mut stderr = tokio::io::stderr();
        stderr.write_all(prompt.as_bytes()).await?;
        stderr.flush().await?;

        let mut line = String::new();
        self.reader.lock().await.read_line(&mut line).await?;
        Ok(line)
    }
}

#[async_trait]
impl<R> Confirmer for LineConfirmer<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn confirm(&self, prompt: &str) -> Result<bool> {
        let answer = self.ask(&format!("{prompt} [Y/n]: ")).await?;
        Ok(is_affirmative(&answer))
    }

    async fn confirm_dangerous(&self, prompt: &str) -> Result<bool> {
        let answer = self
            .ask(&format!(
                "WARNING: {prompt}\nType '{DANGEROUS_TOKEN}' to continue: "
            ))
            .await?;
        Ok(is_dangerous_affirmative(&answer))
    }
}

/// Answers from the invocation flags, falling back to an interactive confirmer.
///
/// `--yes` approves ordinary questions only; the destructive reset still asks
/// unless `--force-reset` was given.
pub struct PolicyConfirmer {
    auto_confirm: bool,
    force_reset: bool,
    fallback: Box<dyn Confirmer>,
}

impl PolicyConfirmer {
    /// Policy from a command context
    pub fn new(ctx: &CommandContext, fallback: Box<dyn Confirmer>) -> Self {
        Self {
            auto_confirm: ctx.auto_confirm,
            force_reset: ctx.force_reset,
            fallback,
        }
    }
}

#[async_trait]
impl Confirmer for PolicyConfirmer {
    async fn confirm(&self, prompt: &str) -> Result<bool> {
        if self.auto_confirm {
            return Ok(true);
        }
        self.fallback.confirm(prompt).await
    }

    async fn confirm_dangerous(&self, prompt: &str) -> Result<bool> {
        if self.force_reset {
            return Ok(true);
        }
        self.fallback.confirm_dangerous(prompt).await
    }
}
