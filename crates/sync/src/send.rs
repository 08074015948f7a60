use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rapport_storage::{ConversationId, IdentityId, NewMessage};
use snafu::ResultExt;

use crate::cache::SessionCache;
use crate::clock::unix_now_millis;
use crate::config::SettingsStore;
use crate::error::{
    RateLimitedSnafu, SyncResult, TransportSnafu, ValidationReason, ValidationSnafu,
};
use crate::model::Message;

/// Sliding-log limiter of accepted sends per identity.
#[derive(Debug, Default)]
pub struct RateLimiter {
    log: Mutex<HashMap<IdentityId, VecDeque<u64>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a send at `now_unix_millis` if the window has room.
    ///
    /// On rejection returns the unix millis at which the oldest logged send leaves the window,
    /// which is always later than `now_unix_millis`.
    pub fn try_acquire(
        &self,
        identity: IdentityId,
        now_unix_millis: u64,
        max_sends: u32,
        window: Duration,
    ) -> Result<(), u64> {
        let window_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let mut log = self
            .log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sends = log.entry(identity).or_default();

        while sends
            .front()
            .is_some_and(|sent_at| sent_at.saturating_add(window_millis) <= now_unix_millis)
        {
            sends.pop_front();
        }

        if sends.len() >= max_sends as usize
            && let Some(oldest) = sends.front()
        {
            return Err(oldest.saturating_add(window_millis));
        }

        sends.push_back(now_unix_millis);
        Ok(())
    }
}

/// Strips characters that render as nothing or rewrite surrounding text.
pub fn sanitize_body(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    normalized
        .chars()
        .filter(|character| match character {
            '\n' | '\t' => true,
            character if character.is_control() => false,
            '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2069}' => false,
            '\u{FEFF}' => false,
            _ => true,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Checks an outgoing body and returns the text to store.
pub fn validate_body(raw: &str, max_chars: usize) -> Result<String, ValidationReason> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationReason::Empty);
    }

    let actual = trimmed.chars().count();
    if actual > max_chars {
        return Err(ValidationReason::TooLong {
            max: max_chars,
            actual,
        });
    }

    let sanitized = sanitize_body(trimmed);
    if sanitized.is_empty() {
        return Err(ValidationReason::Unsanitary);
    }
    Ok(sanitized)
}

/// Validates, submits and, once confirmed, commits outgoing messages.
pub struct SendPipeline {
    cache: Arc<SessionCache>,
    settings: Arc<SettingsStore>,
    limiter: RateLimiter,
}

impl SendPipeline {
    pub fn new(cache: Arc<SessionCache>, settings: Arc<SettingsStore>) -> Self {
        Self {
            cache,
            settings,
            limiter: RateLimiter::new(),
        }
    }

    /// Sends `body` into `conversation_id` as the session identity.
    ///
    /// Local rejections never reach the store. Nothing is cached until the store confirms the
    /// write, so a failed send leaves no trace.
    pub async fn send(&self, conversation_id: ConversationId, body: &str) -> SyncResult<Message> {
        let settings = self.settings.settings();
        let identity = self.cache.identity();

        let body = match validate_body(body, settings.max_body_chars) {
            Ok(body) => body,
            Err(reason) => {
                tracing::debug!(conversation_id = %conversation_id, reason = %reason, "send rejected");
                return ValidationSnafu {
                    stage: "send-validate",
                    reason,
                }
                .fail();
            }
        };

        if let Err(reset_at_unix_millis) = self.limiter.try_acquire(
            identity,
            unix_now_millis(),
            settings.rate_limit_max_sends,
            settings.rate_limit_window(),
        ) {
            tracing::debug!(
                identity = %identity,
                reset_at_unix_millis,
                "send rate limit exceeded"
            );
            return RateLimitedSnafu {
                stage: "send-rate-limit",
                reset_at_unix_millis,
            }
            .fail();
        }

        let receiver_id = self
            .cache
            .resolve_peer(conversation_id, "send-resolve-receiver")
            .await?;

        let record = self
            .cache
            .store()
            .insert_message(NewMessage {
                conversation_id,
                sender_id: identity,
                receiver_id,
                body,
            })
            .await
            .context(TransportSnafu {
                stage: "send-insert-message",
            })
            .inspect_err(|error| {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "message write failed"
                );
            })?;

        let message = Message::from(record);
        self.commit(&message).await;
        Ok(message)
    }

    async fn commit(&self, message: &Message) {
        let identity = self.cache.identity();
        self.cache.timelines().append(message.clone()).await;
        self.cache.surface(message).await;
        self.cache
            .update_directory(|directory| directory.apply_outgoing(message, identity))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn limiter_rejects_past_capacity_with_future_reset() {
        let limiter = RateLimiter::new();
        let identity = IdentityId::new_v7();

        for offset in 0..3 {
            assert!(limiter.try_acquire(identity, 1_000 + offset, 3, WINDOW).is_ok());
        }
        let reset_at = limiter
            .try_acquire(identity, 1_500, 3, WINDOW)
            .unwrap_err();
        assert_eq!(reset_at, 61_000);
        assert!(reset_at >= 1_500);

        assert!(
            limiter
                .try_acquire(IdentityId::new_v7(), 1_500, 3, WINDOW)
                .is_ok(),
            "limits are per identity"
        );
    }

    #[test]
    fn limiter_window_slides() {
        let limiter = RateLimiter::new();
        let identity = IdentityId::new_v7();

        assert!(limiter.try_acquire(identity, 0, 2, WINDOW).is_ok());
        assert!(limiter.try_acquire(identity, 30_000, 2, WINDOW).is_ok());
        assert_eq!(limiter.try_acquire(identity, 59_999, 2, WINDOW), Err(60_000));
        assert!(limiter.try_acquire(identity, 60_000, 2, WINDOW).is_ok());
        assert_eq!(limiter.try_acquire(identity, 60_001, 2, WINDOW), Err(90_000));
    }

    #[test]
    fn rejected_attempts_do_not_consume_capacity() {
        let limiter = RateLimiter::new();
        let identity = IdentityId::new_v7();

        assert!(limiter.try_acquire(identity, 0, 1, WINDOW).is_ok());
        for now in [1, 2, 3] {
            assert!(limiter.try_acquire(identity, now, 1, WINDOW).is_err());
        }
        assert!(limiter.try_acquire(identity, 60_000, 1, WINDOW).is_ok());
    }

    #[test]
    fn validation_reports_each_reason() {
        assert_eq!(validate_body("", 10), Err(ValidationReason::Empty));
        assert_eq!(validate_body("   \n\t ", 10), Err(ValidationReason::Empty));
        assert_eq!(
            validate_body("ééééééééééé", 10),
            Err(ValidationReason::TooLong { max: 10, actual: 11 })
        );
        assert_eq!(validate_body("  ééé  ", 3), Ok("ééé".to_string()));
        assert_eq!(
            validate_body("\u{200B}\u{202E}\u{0007}", 10),
            Err(ValidationReason::Unsanitary)
        );
    }

    #[test]
    fn length_counts_invisible_characters_before_they_are_stripped() {
        assert_eq!(
            validate_body("ab\u{200B}\u{200B}", 3),
            Err(ValidationReason::TooLong { max: 3, actual: 4 })
        );
        assert_eq!(validate_body("ab\u{200B}", 3), Ok("ab".to_string()));
    }

    #[test]
    fn sanitize_normalizes_newlines_and_drops_invisible_characters() {
        assert_eq!(sanitize_body("a\r\nb\rc"), "a\nb\nc");
        assert_eq!(sanitize_body("hi\u{0000}\u{001B} there\t!"), "hi there\t!");
        assert_eq!(sanitize_body("\u{FEFF}abc\u{200D}def\u{2066}"), "abcdef");
        assert_eq!(sanitize_body("  keep inner  spacing "), "keep inner  spacing");
    }
}
