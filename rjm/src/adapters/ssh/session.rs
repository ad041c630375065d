// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use russh::client::{Config, Handle};
use russh::keys::known_hosts::{learn_known_hosts, learn_known_hosts_path};
use tokio::sync::Mutex;

use crate::adapters::network::lookup_first_addr;
use crate::app::errors::{AppResult, network_error};
use crate::app::services::otp::OtpLedger;
use crate::app::types::{Credentials, SshEndpoints};

use super::{HostKeyRejected, map_auth_error, map_connect_error};

mod auth;
mod exec;
mod sftp;

/// russh client handler; only checks server keys.
#[derive(Clone, Debug)]
pub(super) struct ClientHandler {
    host: String,
    port: u16,
    ip: Option<IpAddr>,
    known_hosts_path: Option<PathBuf>,
}

impl ClientHandler {
    fn new(host: String, port: u16, ip: Option<IpAddr>, known_hosts_path: Option<PathBuf>) -> Self {
        Self {
            host,
            port,
            ip,
            known_hosts_path,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        verify_server_key(
            &self.host,
            self.port,
            self.ip,
            server_public_key,
            self.known_hosts_path.as_deref(),
        )
    }
}

fn check_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, russh::keys::Error> {
    match known_hosts_path {
        Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
        None => russh::keys::check_known_hosts(host, port, key),
    }
}

fn learn_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<(), russh::keys::Error> {
    match known_hosts_path {
        Some(path) => learn_known_hosts_path(host, port, key, path),
        None => learn_known_hosts(host, port, key),
    }
}

/// Accepts keys already in known_hosts (by name, then by address) and
/// records unknown ones. A changed key is rejected.
fn verify_server_key(
    host: &str,
    port: u16,
    ip: Option<IpAddr>,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, anyhow::Error> {
    let rejected = |reason: String| {
        tracing::warn!("server key validation failed for {host}:{port}: {reason}");
        anyhow::Error::new(HostKeyRejected {
            host: host.to_string(),
            port,
            reason,
        })
    };

    let mut candidates = vec![host.to_string()];
    if let Some(ip) = ip.map(|ip| ip.to_string()).filter(|ip| ip != host) {
        candidates.push(ip);
    }
    for candidate in &candidates {
        match check_known_hosts_for(candidate, port, key, known_hosts_path) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => return Err(rejected(err.to_string())),
        }
    }

    tracing::info!(
        "server key for {host}:{port} is not present in known_hosts (tried {}); learning",
        candidates.join(", ")
    );
    learn_known_hosts_for(host, port, key, known_hosts_path)
        .map_err(|err| rejected(format!("failed to learn key: {err}")))?;
    Ok(true)
}

async fn disconnect(handle: &Handle<ClientHandler>) {
    if let Err(err) = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
    {
        tracing::debug!("error while disconnecting: {err}");
    }
}

/// An authenticated session on the login node, tunnelled through the lander.
///
/// The lander connection carries the login connection and stays open for as
/// long as the session does.
pub struct TwoHopSession {
    lander: Mutex<Option<Handle<ClientHandler>>>,
    login: Mutex<Option<Handle<ClientHandler>>>,
    transfer: Mutex<Option<sftp::FileChannel>>,
    login_host: String,
    closed: AtomicBool,
}

impl TwoHopSession {
    pub async fn connect(
        config: Arc<Config>,
        endpoints: &SshEndpoints,
        credentials: &Credentials,
        ledger: &OtpLedger,
    ) -> AppResult<Self> {
        let lander_host = &endpoints.lander_host;
        let addr = lookup_first_addr(lander_host, endpoints.port).await?;
        let handler = ClientHandler::new(
            lander_host.clone(),
            endpoints.port,
            Some(addr.ip()),
            endpoints.known_hosts_path.clone(),
        );
        tracing::info!(host = %lander_host, %addr, "connecting to lander");
        let mut lander = russh::client::connect(config.clone(), addr, handler)
            .await
            .map_err(|err| map_connect_error(err, lander_host))?;
        if let Err(err) = auth::authenticate(&mut lander, credentials, ledger, "lander").await {
            disconnect(&lander).await;
            return Err(map_auth_error(err, lander_host));
        }

        match Self::connect_login(&lander, config, endpoints, credentials, ledger).await {
            Ok(login) => {
                tracing::info!(host = %endpoints.login_host, "session established");
                Ok(Self {
                    lander: Mutex::new(Some(lander)),
                    login: Mutex::new(Some(login)),
                    transfer: Mutex::new(None),
                    login_host: endpoints.login_host.clone(),
                    closed: AtomicBool::new(false),
                })
            }
            Err(err) => {
                disconnect(&lander).await;
                Err(err)
            }
        }
    }

    async fn connect_login(
        lander: &Handle<ClientHandler>,
        config: Arc<Config>,
        endpoints: &SshEndpoints,
        credentials: &Credentials,
        ledger: &OtpLedger,
    ) -> AppResult<Handle<ClientHandler>> {
        let login_host = &endpoints.login_host;
        let channel = lander
            .channel_open_direct_tcpip(
                login_host.clone(),
                u32::from(endpoints.port),
                "127.0.0.1",
                0,
            )
            .await
            .map_err(|err| {
                network_error(format!(
                    "lander could not open a tunnel to {login_host}:{}: {err}",
                    endpoints.port
                ))
            })?;
        let handler = ClientHandler::new(
            login_host.clone(),
            endpoints.port,
            None,
            endpoints.known_hosts_path.clone(),
        );
        tracing::info!(host = %login_host, "connecting to login node through lander");
        let mut login = russh::client::connect_stream(config, channel.into_stream(), handler)
            .await
            .map_err(|err| map_connect_error(err, login_host))?;
        if let Err(err) = auth::authenticate(&mut login, credentials, ledger, "login").await {
            disconnect(&login).await;
            return Err(map_auth_error(err, login_host));
        }
        Ok(login)
    }

    pub fn login_host(&self) -> &str {
        &self.login_host
    }

    pub async fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        let hop_down = |hop: &Option<Handle<ClientHandler>>| hop.as_ref().is_none_or(|h| h.is_closed());
        hop_down(&*self.login.lock().await) || hop_down(&*self.lander.lock().await)
    }

    /// Closes the transfer channel and both hops, innermost first.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.transfer.lock().await.take());
        if let Some(login) = self.login.lock().await.take() {
            disconnect(&login).await;
        }
        if let Some(lander) = self.lander.lock().await.take() {
            disconnect(&lander).await;
        }
        tracing::debug!(host = %self.login_host, "session closed");
    }
}
