use anyhow::{bail, Context, Result};
use console::Style;
use dialoguer::{Confirm, Input, Password, Select};
use mssso::{totp, ConnectionProfile, CredentialStore, Protocol, SecretKind};

const PROTOCOLS: [Protocol; 2] = [Protocol::AnyConnect, Protocol::GlobalProtect];

/// Prompts for a connection and stores it with its secrets.
pub(crate) fn run(credentials: &CredentialStore) -> Result<String> {
    let name: String = Input::new()
        .with_prompt("Connection name")
        .interact_text()
        .context("read connection name")?;
    let existing = credentials.profile(&name).ok();

    let address: String = Input::new()
        .with_prompt("VPN server address")
        .with_initial_text(existing.as_ref().map(|p| p.address.clone()).unwrap_or_default())
        .interact_text()
        .context("read server address")?;

    let labels: Vec<&str> = PROTOCOLS.iter().map(|p| p.display_name()).collect();
    let default = existing
        .as_ref()
        .and_then(|p| PROTOCOLS.iter().position(|x| *x == p.protocol))
        .unwrap_or(0);
    let protocol = PROTOCOLS[Select::new()
        .with_prompt("Protocol")
        .items(&labels)
        .default(default)
        .interact()
        .context("read protocol")?];

    let username: String = Input::new()
        .with_prompt("Username (email)")
        .with_initial_text(existing.as_ref().map(|p| p.username.clone()).unwrap_or_default())
        .interact_text()
        .context("read username")?;

    let password = Password::new()
        .with_prompt("Password")
        .allow_empty_password(existing.is_some())
        .interact()
        .context("read password")?;

    let seed: String = Input::new()
        .with_prompt("TOTP secret (empty to approve pushes instead)")
        .allow_empty(true)
        .validate_with(|s: &String| {
            if s.trim().is_empty() || totp::validate_seed(s) {
                Ok(())
            } else {
                Err("not a base32 secret")
            }
        })
        .interact_text()
        .context("read TOTP secret")?;

    let no_dtls = Confirm::new()
        .with_prompt("Disable DTLS (use when UDP is blocked)?")
        .default(existing.as_ref().is_some_and(|p| p.no_dtls))
        .interact()
        .context("read DTLS choice")?;

    let mut profile = ConnectionProfile::new(name.trim(), address.trim(), protocol, username.trim());
    profile.no_dtls = no_dtls;
    if let Some(previous) = existing {
        profile.flags = previous.flags;
    }
    if let Err(reason) = profile.validate() {
        bail!("{}", reason);
    }

    credentials.save_profile(&profile)?;
    if !password.is_empty() {
        credentials.set_secret(&profile.name, SecretKind::Password, &password)?;
    }
    if !seed.trim().is_empty() {
        credentials.set_secret(&profile.name, SecretKind::TotpSeed, &totp::normalize_seed(&seed))?;
        if let Ok(code) = totp::generate(&seed) {
            log::info!("Current code for this secret: {}", code);
        }
    }
    log::info!("[✓] Saved connection '{}'", profile.name);
    Ok(profile.name)
}

pub(crate) fn list(credentials: &CredentialStore) -> Result<()> {
    let profiles = credentials.profiles()?;
    if profiles.is_empty() {
        eprintln!("No saved connections. Create one with --setup.");
        return Ok(());
    }
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    for p in profiles {
        let totp = credentials
            .get_secret(&p.name, SecretKind::TotpSeed)
            .ok()
            .flatten()
            .is_some();
        println!(
            "{}  {} {} as {}{}",
            bold.apply_to(&p.name),
            dim.apply_to(p.protocol.display_name()),
            p.address,
            p.username,
            if totp { " (TOTP)" } else { "" }
        );
    }
    Ok(())
}

/// The connection named on the command line, the only saved one, or a prompt.
pub(crate) fn pick(credentials: &CredentialStore, requested: Option<&str>) -> Result<String> {
    if let Some(name) = requested {
        return Ok(name.to_string());
    }
    let mut names: Vec<String> = credentials.profiles()?.into_iter().map(|p| p.name).collect();
    match names.len() {
        0 => bail!("No saved connections. Create one with --setup."),
        1 => Ok(names.remove(0)),
        _ => {
            let index = Select::new()
                .with_prompt("Connection")
                .items(&names)
                .default(0)
                .interact()
                .context("pick connection")?;
            Ok(names.swap_remove(index))
        }
    }
}
