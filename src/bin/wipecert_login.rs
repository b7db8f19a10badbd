//!
//! wipecert sign-in shell
//! ----------------------
//! Terminal front end for the sign-in gate. Resumes a remembered session when one is on disk,
//! otherwise prompts for credentials. All network work runs on the coordinator task; this loop
//! only sends commands and prints the results that come back.

use std::borrow::Cow;
use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustyline::completion::Completer;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Editor, Helper};

use wipecert::backend::BackendClient;
use wipecert::config::Config;
use wipecert::identity::secret::hash_secret;
use wipecert::identity::{spawn, AuthCommand, AuthCoordinator, AuthEvent, AuthHandle, Credential, IdentityClient, SessionStore};
use wipecert::net::HttpReachability;

const MAX_ATTEMPTS: usize = 3;

/// Echoes `*` instead of the typed characters while `masking` is set.
#[derive(Default)]
struct Prompt {
    masking: bool,
}

impl Highlighter for Prompt {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if self.masking { Cow::Owned("*".repeat(line.chars().count())) } else { Cow::Borrowed(line) }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool { self.masking }
}

impl Completer for Prompt {
    type Candidate = String;
}

impl Hinter for Prompt {
    type Hint = String;
}

impl Validator for Prompt {}
impl Helper for Prompt {}

type Shell = Editor<Prompt, DefaultHistory>;

fn shell() -> Result<Shell> {
    let mut rl: Shell = Editor::new().context("initialising terminal")?;
    rl.set_helper(Some(Prompt::default()));
    Ok(rl)
}

fn read_secret(rl: &mut Shell, prompt: &str) -> Result<String> {
    if let Some(h) = rl.helper_mut() { h.masking = true; }
    let line = rl.readline(prompt);
    if let Some(h) = rl.helper_mut() { h.masking = false; }
    Ok(line?)
}

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} [--remember]     sign in (or resume a remembered session)\n  {program} status           show connectivity and session state\n  {program} logout           sign out and delete the local session\n  {program} hash-secret      print an Argon2 hash for a user-table row\n\nFlags:\n  --remember   keep the session on disk for 24 hours\n  -h, --help   show this help"
    );
}

async fn request(handle: &mut AuthHandle, cmd: AuthCommand) -> Result<AuthEvent> {
    if !handle.send(cmd).await {
        anyhow::bail!("sign-in worker stopped");
    }
    handle.next_event().await.context("sign-in worker stopped")
}

async fn sign_in(handle: &mut AuthHandle, remember: bool) -> Result<bool> {
    if let AuthEvent::Resumed(Some(identity)) = request(handle, AuthCommand::Resume).await? {
        println!("Welcome back, {} (session resumed)", identity.email);
        return Ok(true);
    }
    if let AuthEvent::Connection(status) = request(handle, AuthCommand::CheckConnection).await? {
        println!("{}", status.message());
    }

    let mut rl = shell()?;
    for _ in 0..MAX_ATTEMPTS {
        let email = rl.readline("Email: ")?;
        let secret = read_secret(&mut rl, "Password: ")?;
        println!("Authenticating...");
        let cmd = AuthCommand::SignIn { credential: Credential::new(email, secret), remember };
        match request(handle, cmd).await? {
            AuthEvent::SignedIn(Ok(identity)) => {
                println!("Login successful! Welcome, {}", identity.email);
                return Ok(true);
            }
            AuthEvent::SignedIn(Err(e)) => println!("{}", e),
            other => tracing::debug!(target: "auth", "unexpected reply {:?}", other),
        }
    }
    Ok(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();

    let mut args: Vec<String> = env::args().collect();
    let program = args.remove(0);
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage(&program);
        return Ok(());
    }
    let remember = args.iter().any(|a| a == "--remember");
    let command = args.iter().find(|a| !a.starts_with('-')).cloned().unwrap_or_else(|| "login".to_string());

    if command == "hash-secret" {
        let mut rl = shell()?;
        let secret = read_secret(&mut rl, "Secret: ")?;
        println!("{}", hash_secret(&secret)?);
        return Ok(());
    }

    let cfg = Config::load().context("loading configuration")?;
    let backend = BackendClient::for_client(&cfg).context("building backend client")?;
    let net = Arc::new(HttpReachability::new(&cfg, backend.clone()).context("building reachability probes")?);
    let identity = Arc::new(IdentityClient::new(backend, &cfg));
    let store = SessionStore::open(&cfg).context("opening session store")?;
    let mut handle = spawn(AuthCoordinator::new(net, identity, store));

    let code = match command.as_str() {
        "login" => {
            if sign_in(&mut handle, remember).await? { 0 } else { 1 }
        }
        "logout" => {
            request(&mut handle, AuthCommand::SignOut).await?;
            println!("Signed out.");
            0
        }
        "status" => {
            if let AuthEvent::Connection(status) = request(&mut handle, AuthCommand::CheckConnection).await? {
                println!("{}", status.message());
            }
            match request(&mut handle, AuthCommand::Resume).await? {
                AuthEvent::Resumed(Some(identity)) => println!("Signed in as {} via {}", identity.email, identity.verification_method),
                _ => println!("No remembered session"),
            }
            0
        }
        other => {
            eprintln!("unknown command: {}", other);
            print_usage(&program);
            2
        }
    };
    let _ = handle.shutdown().await;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_masks_only_while_reading_a_secret() {
        let mut p = Prompt::default();
        assert_eq!(p.highlight("hunter2", 7), "hunter2");
        assert!(!p.highlight_char("hunter2", 7, false));
        p.masking = true;
        assert_eq!(p.highlight("hunter2", 7), "*******");
        assert!(p.highlight_char("hunter2", 7, true));
    }
}
