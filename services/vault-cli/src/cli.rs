//! Argument parsing
//!
//! `vaultctl [flags] <command>`. Flags may appear anywhere on the line.

use crate::error::{Error, Result};

pub const USAGE: &str = "\
Usage: vaultctl [flags] <command>

Commands:
  auth                     Print an access token (cached when still valid)
  auth clear               Delete cached tokens of the active profile
  auth list                List every cached token key
  auth set-password        Store the profile password (hidden prompt)
  auth set-secret <name>   Store a secure setting, e.g. auth.client.secret
                           (hidden prompt, or one line from piped stdin)
  whoami                   Print the subject of the current token

Flags:
  --config <path>          Config file (default: ~/.vaultctl/config.toml)
  --profile <name>         Profile to use (default: default)
  --tenant <name>          Tenant override
  --auth-type <type>       password, refresh, clientcred, cert, thy-one,
                           oidc, aws, azure, gcp
  --auth-username <name>
  --auth-password <pass>
  --auth-provider <name>
  --no-cache               Neither read nor write cached tokens
  --no-browser             Print the OIDC login URL instead of opening it
  -v, --verbose            Debug logging on stderr
  -h, --help
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Auth,
    AuthClear,
    AuthList,
    AuthSetPassword,
    AuthSetSecret(String),
    WhoAmI,
    Help,
}

/// Flag values that override the profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub tenant: Option<String>,
    pub auth_type: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub provider: Option<String>,
    pub no_cache: bool,
    pub no_browser: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub config: Option<String>,
    pub profile: Option<String>,
    pub verbose: bool,
    pub overrides: Overrides,
    pub command: Command,
}

impl Cli {
    /// Parse arguments without the program name.
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut config = None;
        let mut profile = None;
        let mut verbose = false;
        let mut help = false;
        let mut overrides = Overrides::default();
        let mut words = Vec::new();

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let mut value = || {
                iter.next()
                    .cloned()
                    .ok_or_else(|| Error::MissingValue(arg.clone()))
            };
            match arg.as_str() {
                "--config" => config = Some(value()?),
                "--profile" => profile = Some(value()?),
                "--tenant" => overrides.tenant = Some(value()?),
                "--auth-type" => overrides.auth_type = Some(value()?),
                "--auth-username" => overrides.username = Some(value()?),
                "--auth-password" => overrides.password = Some(value()?),
                "--auth-provider" => overrides.provider = Some(value()?),
                "--no-cache" => overrides.no_cache = true,
                "--no-browser" => overrides.no_browser = true,
                "-v" | "--verbose" => verbose = true,
                "-h" | "--help" => help = true,
                flag if flag.starts_with('-') => return Err(Error::UnknownFlag(flag.to_owned())),
                word => words.push(word.to_owned()),
            }
        }

        let command = if help {
            Command::Help
        } else {
            parse_command(&words)?
        };

        Ok(Self {
            config,
            profile,
            verbose,
            overrides,
            command,
        })
    }
}

fn parse_command(words: &[String]) -> Result<Command> {
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    match words.as_slice() {
        [] => Ok(Command::Help),
        ["auth"] => Ok(Command::Auth),
        ["auth", "clear"] => Ok(Command::AuthClear),
        ["auth", "list"] => Ok(Command::AuthList),
        ["auth", "set-password"] => Ok(Command::AuthSetPassword),
        ["auth", "set-secret", setting] => Ok(Command::AuthSetSecret((*setting).to_owned())),
        ["auth", "set-secret"] => Err(Error::MissingSetting("auth set-secret".into())),
        ["whoami"] => Ok(Command::WhoAmI),
        other => Err(Error::UnknownCommand(other.join(" "))),
    }
}
