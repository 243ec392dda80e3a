//! Built-in utility tools registered at startup.

use super::Tool;
use crate::cancellation::{race_with_abort, CancelToken};
use crate::{MaestroError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Returns its `text` argument unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn kind(&self) -> &str {
        "utility"
    }

    fn validate(&self, args: &Value) -> Result<()> {
        match args.get("text") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(MaestroError::Validation(
                "echo requires a string `text` argument".into(),
            )),
        }
    }

    async fn execute(&self, args: Value, _token: &CancelToken) -> Result<Value> {
        Ok(json!({ "text": args["text"] }))
    }
}

/// Word, line, and character counts over a text payload.
pub struct TextStatsTool;

#[async_trait]
impl Tool for TextStatsTool {
    fn name(&self) -> &str {
        "text-stats"
    }

    fn kind(&self) -> &str {
        "utility"
    }

    fn validate(&self, args: &Value) -> Result<()> {
        match args.get("text") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(MaestroError::Validation(
                "text-stats requires a string `text` argument".into(),
            )),
        }
    }

    async fn execute(&self, args: Value, _token: &CancelToken) -> Result<Value> {
        let text = args["text"].as_str().unwrap_or_default();
        Ok(json!({
            "chars": text.chars().count(),
            "words": text.split_whitespace().count(),
            "lines": text.lines().count(),
        }))
    }
}

/// Sleeps for `ms` milliseconds, honoring cancellation. Used to exercise
/// timeout and abort paths.
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn kind(&self) -> &str {
        "utility"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn validate(&self, args: &Value) -> Result<()> {
        match args.get("ms").and_then(Value::as_u64) {
            Some(_) => Ok(()),
            None => Err(MaestroError::Validation(
                "sleep requires a numeric `ms` argument".into(),
            )),
        }
    }

    async fn execute(&self, args: Value, token: &CancelToken) -> Result<Value> {
        let ms = args["ms"].as_u64().unwrap_or(0);
        race_with_abort(token, async {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_round_trips_text() {
        let tool = EchoTool;
        let out = tool
            .execute(json!({"text": "hello"}), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(out["text"], "hello");
    }

    #[tokio::test]
    async fn text_stats_counts() {
        let tool = TextStatsTool;
        let out = tool
            .execute(json!({"text": "one two\nthree"}), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(out["words"], 3);
        assert_eq!(out["lines"], 2);
    }

    #[tokio::test]
    async fn sleep_aborts_promptly() {
        let tool = SleepTool;
        let token = CancelToken::new();
        let aborter = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            aborter.abort("cancelled");
        });
        let err = tool
            .execute(json!({"ms": 5000}), &token)
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }

    #[test]
    fn validation_rejects_missing_args() {
        assert!(EchoTool.validate(&json!({})).is_err());
        assert!(SleepTool.validate(&json!({"ms": "soon"})).is_err());
    }
}
