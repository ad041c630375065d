// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

/// Time source boundary for UTC timestamps and waiting.
/// Makes time-dependent logic (OTP steps, backoff) deterministic and testable.
#[async_trait]
pub trait ClockPort: Send + Sync {
    fn now_utc(&self) -> OffsetDateTime;

    async fn sleep(&self, duration: Duration);
}
