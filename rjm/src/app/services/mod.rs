// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod lifecycle;
pub mod manifest;
pub mod otp;
pub mod remote_api;
pub mod retry;
pub mod shell;
