use std::io;
use std::sync::Arc;

use anyhow::Result;
use mailwatch_core::{LoginChallengeController, LoginStep, NULL_BACKEND_NAME, NullBackend};
use mailwatch_jobs::{MIN_RECURRING_INTERVAL_MINUTES, ScheduleError, Watcher, strategy_for};
use serde_json::json;
use tokio::runtime::{Handle, Runtime};
use tracing::{info, warn};

use super::{CliCommand, LoginCmd, WatchConfig, output_error, output_ok, run_login_wizard};
use crate::render_mod::notification_to_json;

pub(crate) fn run_cli(rt: &Runtime, command: CliCommand, config: &WatchConfig) -> Result<()> {
    match command {
        CliCommand::Schedule(cmd) => schedule_report(cmd.interval),
        CliCommand::Poll => rt.block_on(run_poll(config)),
        CliCommand::Watch(cmd) => rt.block_on(async {
            let backend = NullBackend::new(config.null_accounts.clone());
            sign_in_configured(&backend, config, None).await;
            let interval = cmd.interval.unwrap_or(config.interval_minutes);
            run_watch(backend, interval, cmd.now).await
        }),
        CliCommand::Login(cmd) => rt.block_on(run_login(config, cmd)),
    }
}

fn schedule_report(interval_minutes: u32) -> Result<()> {
    if interval_minutes == 0 {
        return output_error(&ScheduleError::InvalidInterval(interval_minutes).to_string());
    }
    let mode = strategy_for(interval_minutes);
    output_ok(json!({
        "interval_minutes": interval_minutes,
        "mode": mode.label(),
        "min_recurring_minutes": MIN_RECURRING_INTERVAL_MINUTES,
        "delay_secs": u64::from(interval_minutes) * 60,
    }))
}

/// Sign in every configured account that needs no interactive challenge.
/// `skip` is an account the caller already signed in.
async fn sign_in_configured(
    backend: &NullBackend,
    config: &WatchConfig,
    skip: Option<&str>,
) -> Vec<String> {
    let mut signed_in = Vec::new();
    for identity in config.watched_accounts() {
        if skip == Some(identity.email.as_str()) {
            continue;
        }
        if identity.backend != NULL_BACKEND_NAME {
            warn!(
                email = %identity.email,
                backend = %identity.backend,
                "unsupported backend, skipping"
            );
            continue;
        }
        let Some(spec) = config
            .null_accounts
            .iter()
            .find(|spec| spec.email == identity.email)
        else {
            warn!(email = %identity.email, "no credentials configured, skipping");
            continue;
        };
        let mut login =
            LoginChallengeController::new(Arc::new(backend.clone()), identity.proxy.clone());
        match login.submit_credentials(&identity.email, &spec.password).await {
            Ok(LoginStep::Authenticated) => match login.register_with(backend).await {
                Ok(identity) => signed_in.push(identity.email),
                Err(err) => warn!(email = %identity.email, %err, "failed to register account"),
            },
            Ok(step) => {
                warn!(
                    email = %identity.email,
                    ?step,
                    "account needs an interactive login, run `mailwatch login`"
                );
            }
            Err(err) => warn!(email = %identity.email, %err, "sign-in failed"),
        }
    }
    signed_in
}

async fn run_poll(config: &WatchConfig) -> Result<()> {
    let backend = NullBackend::new(config.null_accounts.clone());
    let signed_in = sign_in_configured(&backend, config, None).await;
    let (watcher, _rx) = Watcher::start(Handle::current(), Arc::new(backend));
    let (report, posted) = watcher.poll_once().await;
    watcher.shutdown();

    let notifications: Vec<_> = posted.iter().map(notification_to_json).collect();
    output_ok(json!({
        "accounts": signed_in,
        "events": report.events,
        "messages": report.messages,
        "failed_accounts": report.failed_accounts,
        "service_error": report.service_error.map(|err| err.to_string()),
        "notifications": notifications,
    }))
}

async fn run_watch(backend: NullBackend, interval_minutes: u32, now: bool) -> Result<()> {
    let accounts = backend.active_accounts().len();
    let (watcher, mut rx) = Watcher::start(Handle::current(), Arc::new(backend));
    watcher.scheduler().resume(interval_minutes)?;
    if now {
        watcher.poll_now()?;
    }
    if let Some(state) = watcher.scheduler().state() {
        info!(
            accounts,
            interval_minutes = state.interval_minutes,
            mode = state.mode.label(),
            since = %state.registered_at.to_rfc3339(),
            "watching"
        );
    }

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            result = &mut interrupted => {
                result?;
                break;
            }
            notification = rx.recv() => match notification {
                Some(notification) => output_ok(notification_to_json(&notification))?,
                None => break,
            },
        }
    }
    watcher.shutdown();
    info!(
        unread = watcher.registry().live_message_ids().len(),
        "watcher stopped"
    );
    Ok(())
}

async fn run_login(config: &WatchConfig, cmd: LoginCmd) -> Result<()> {
    let backend = NullBackend::new(config.null_accounts.clone());
    let proxy = config
        .accounts
        .iter()
        .find(|acct| acct.email == cmd.email)
        .and_then(|acct| acct.proxy.clone());
    let identity = {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut prompts = io::stderr();
        run_login_wizard(
            Arc::new(backend.clone()),
            &backend,
            proxy,
            &cmd.email,
            &mut input,
            &mut prompts,
        )
        .await?
    };
    if !cmd.watch {
        return output_ok(json!({
            "email": identity.email,
            "backend": identity.backend,
        }));
    }
    sign_in_configured(&backend, config, Some(&identity.email)).await;
    run_watch(backend, config.interval_minutes, true).await
}
