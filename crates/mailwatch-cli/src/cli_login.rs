use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Result, bail};
use mailwatch_core::{
    AccountIdentity, AccountStore, Backend, LoginChallengeController, LoginError, LoginStep,
    ProxyConfig,
};
use tracing::info;

fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W, label: &str) -> Result<String> {
    write!(output, "{}: ", label)?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        bail!("input closed while waiting for {}", label.to_lowercase());
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Walk one login attempt through every challenge, reading answers from
/// `input`, then register the account with `store`. A one-time code the
/// backend rejects is asked again; every other failure ends the attempt.
pub(crate) async fn run_login_wizard<R: BufRead, W: Write>(
    backend: Arc<dyn Backend>,
    store: &dyn AccountStore,
    proxy: Option<ProxyConfig>,
    email: &str,
    input: &mut R,
    output: &mut W,
) -> Result<AccountIdentity> {
    let mut login = LoginChallengeController::new(backend, proxy);
    let password = prompt(input, output, &format!("Password for {}", email))?;
    let mut step = login.submit_credentials(email, &password).await?;
    loop {
        match step {
            LoginStep::Authenticated => break,
            LoginStep::NeedsHumanVerification(challenge) => {
                writeln!(
                    output,
                    "Human verification required ({:?}): {}",
                    challenge.kind, challenge.payload
                )?;
                let token = prompt(input, output, "Verification token")?;
                step = login.submit_verification_token(&token).await?;
            }
            LoginStep::NeedsOneTimeCode => {
                let code = prompt(input, output, "One-time code")?;
                step = match login.submit_one_time_code(&code).await {
                    Ok(next) => next,
                    Err(LoginError::Service(err)) => {
                        writeln!(output, "Code rejected: {}", err)?;
                        LoginStep::NeedsOneTimeCode
                    }
                    Err(err) => return Err(err.into()),
                };
            }
        }
    }
    let identity = login.register_with(store).await?;
    info!(email = %identity.email, backend = %identity.backend, "account signed in");
    writeln!(output, "Signed in as {}", identity.email)?;
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use mailwatch_core::{NullAccountSpec, NullBackend};

    use super::run_login_wizard;

    fn backend() -> NullBackend {
        NullBackend::new(vec![NullAccountSpec {
            email: "bob@example.com".to_string(),
            password: "pw".to_string(),
            totp: Some("123456".to_string()),
            human_verification: true,
            messages_per_poll: 1,
        }])
    }

    #[tokio::test]
    async fn answers_every_challenge_and_retries_bad_code() -> anyhow::Result<()> {
        let backend = backend();
        let mut input = Cursor::new("pw\ntok1\n000000\n123456\n");
        let mut output = Vec::new();
        let identity = run_login_wizard(
            Arc::new(backend.clone()),
            &backend,
            None,
            "bob@example.com",
            &mut input,
            &mut output,
        )
        .await?;

        assert_eq!(identity.email, "bob@example.com");
        assert_eq!(backend.active_accounts(), vec![identity]);
        let transcript = String::from_utf8(output)?;
        assert!(transcript.contains("null-captcha:bob@example.com"));
        assert!(transcript.contains("Code rejected"));
        assert!(transcript.ends_with("Signed in as bob@example.com\n"));
        Ok(())
    }

    #[tokio::test]
    async fn closed_input_and_wrong_password_fail() {
        let backend = backend();
        let mut output = Vec::new();
        let closed = run_login_wizard(
            Arc::new(backend.clone()),
            &backend,
            None,
            "bob@example.com",
            &mut Cursor::new("pw\n"),
            &mut output,
        )
        .await;
        assert!(closed.unwrap_err().to_string().contains("input closed"));

        let wrong = run_login_wizard(
            Arc::new(backend.clone()),
            &backend,
            None,
            "bob@example.com",
            &mut Cursor::new("nope\n"),
            &mut output,
        )
        .await;
        assert!(wrong.is_err());
        assert!(backend.active_accounts().is_empty());
    }
}
