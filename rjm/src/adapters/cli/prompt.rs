// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io::Write;

use anyhow::bail;

/// Asks until a non-empty answer is given; an empty line takes `default`.
pub async fn ask(prompt: &str, default: Option<&str>) -> anyhow::Result<String> {
    let shown = match default {
        Some(default) => format!("{prompt} [{default}]: "),
        None => format!("{prompt}: "),
    };
    loop {
        let line = read_line(&shown).await?;
        if let Some(answer) = resolve_answer(&line, default) {
            return Ok(answer);
        }
        eprintln!("{prompt} must not be empty");
    }
}

/// Like [`ask`], but an answer already present in `env_var` is used without
/// prompting so scripted setups need not type secrets into a terminal.
pub async fn ask_secret(prompt: &str, env_var: &str) -> anyhow::Result<String> {
    if let Some(value) = std::env::var(env_var)
        .ok()
        .filter(|value| !value.trim().is_empty())
    {
        return Ok(value.trim().to_string());
    }
    ask(&format!("{prompt} (or set {env_var})"), None).await
}

fn resolve_answer(line: &str, default: Option<&str>) -> Option<String> {
    let trimmed = line.trim();
    if !trimmed.is_empty() {
        return Some(trimmed.to_string());
    }
    default
        .filter(|default| !default.is_empty())
        .map(str::to_string)
}

async fn read_line(prompt: &str) -> anyhow::Result<String> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        eprint!("{prompt}");
        std::io::stderr().flush()?;
        let mut s = String::new();
        if std::io::stdin().read_line(&mut s)? == 0 {
            bail!("stdin closed while waiting for input");
        }
        while s.ends_with('\n') || s.ends_with('\r') {
            s.pop();
        }
        Ok(s)
    })
    .await?
}
