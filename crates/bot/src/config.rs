use std::{fs, path::Path};

use anyhow::{Context as _, Result, anyhow, bail};
use bridge_core::CommandSpec;
use reqwest::Url;
use serde::Deserialize;

/// Either a single value or a list, e.g. `rooms: "#ops:example.org"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl OneOrMany {
    pub(crate) fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CommandConfig {
    #[serde(default)]
    pub(crate) word: Option<String>,
    #[serde(default)]
    pub(crate) expression: Option<String>,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) rooms: OneOrMany,
}

impl CommandConfig {
    fn into_spec(self) -> Result<CommandSpec> {
        if self.name.trim().is_empty() {
            bail!("command name must not be empty");
        }
        let rooms = self.rooms.into_vec();
        match (self.word, self.expression) {
            (Some(word), None) => Ok(CommandSpec::word(self.name, word, rooms)),
            (None, Some(expression)) => CommandSpec::expression(&self.name, &expression, rooms)
                .with_context(|| format!("invalid expression for command '{}'", self.name)),
            (Some(_), Some(_)) => bail!(
                "command '{}' must set only one of `word` or `expression`",
                self.name
            ),
            (None, None) => bail!(
                "command '{}' needs a `word` or an `expression`",
                self.name
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    homeserver: String,
    #[serde(default = "verify_ssl_default")]
    verify_ssl: bool,
    username: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    rooms: OneOrMany,
    #[serde(default)]
    commands: Vec<CommandConfig>,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    webhook_url: Option<String>,
}

const fn verify_ssl_default() -> bool {
    true
}

/// Validated bridge configuration.
#[derive(Debug)]
pub(crate) struct BridgeConfig {
    pub(crate) homeserver: Url,
    pub(crate) verify_ssl: bool,
    pub(crate) username: String,
    pub(crate) password: Option<String>,
    pub(crate) rooms: Vec<String>,
    pub(crate) commands: Vec<CommandSpec>,
    pub(crate) device_name: Option<String>,
    pub(crate) webhook_url: Option<Url>,
}

impl BridgeConfig {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!(
                "config file not found at {}. Create one or set --config",
                path.display()
            ));
        }
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("reading config file at {}", path.display()))?;
        Self::parse(&yaml)
    }

    pub(crate) fn parse(yaml: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(yaml).context("parsing YAML config")?;
        raw.validate()
    }
}

impl RawConfig {
    fn validate(self) -> Result<BridgeConfig> {
        let homeserver = parse_http_url(&self.homeserver).context("invalid `homeserver`")?;
        if !is_full_user_id(&self.username) {
            bail!(
                "invalid `username` '{}': expected a full user ID like @bot:example.org",
                self.username
            );
        }
        let webhook_url = self
            .webhook_url
            .as_deref()
            .map(parse_http_url)
            .transpose()
            .context("invalid `webhook_url`")?;
        let commands = self
            .commands
            .into_iter()
            .enumerate()
            .map(|(i, c)| c.into_spec().with_context(|| format!("commands[{i}]")))
            .collect::<Result<Vec<_>>>()?;

        Ok(BridgeConfig {
            homeserver,
            verify_ssl: self.verify_ssl,
            username: self.username,
            password: self.password.filter(|p| !p.is_empty()),
            rooms: self.rooms.into_vec(),
            commands,
            device_name: self.device_name,
            webhook_url,
        })
    }
}

/// `@localpart:server`; the localpart may be empty but the colon may not.
fn is_full_user_id(user: &str) -> bool {
    user.strip_prefix('@').is_some_and(|rest| rest.contains(':'))
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("'{raw}' is not a URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("'{raw}' must use http or https");
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use bridge_core::Trigger;

    use super::*;

    const FULL: &str = r##"
homeserver: https://matrix.example.org
username: "@bot:example.org"
password: hunter2
rooms:
  - "#lobby:example.org"
  - "!ops:example.org"
commands:
  - word: ping
    name: Ping
  - expression: "^status: (?<state>\\w+)"
    name: Status
    rooms: "#lobby:example.org"
"##;

    #[test]
    fn parses_full_config() {
        let cfg = BridgeConfig::parse(FULL).unwrap();
        assert_eq!(cfg.homeserver.as_str(), "https://matrix.example.org/");
        assert!(cfg.verify_ssl);
        assert_eq!(cfg.password.as_deref(), Some("hunter2"));
        assert_eq!(cfg.rooms, ["#lobby:example.org", "!ops:example.org"]);
        assert_eq!(cfg.commands.len(), 2);
        assert!(matches!(&cfg.commands[0].trigger, Trigger::Word(w) if w == "ping"));
        assert!(cfg.commands[0].rooms.is_empty());
        assert!(matches!(&cfg.commands[1].trigger, Trigger::Expression(e) if e.as_str() == r"^status: (?<state>\w+)"));
        assert_eq!(cfg.commands[1].rooms, ["#lobby:example.org"]);
    }

    #[test]
    fn single_room_string_is_a_list() {
        let cfg = BridgeConfig::parse(
            "homeserver: http://localhost:8008\nusername: '@bot:localhost'\nrooms: '#a:localhost'\nverify_ssl: false\n",
        )
        .unwrap();
        assert_eq!(cfg.rooms, ["#a:localhost"]);
        assert!(!cfg.verify_ssl);
        assert!(cfg.commands.is_empty());
        assert!(cfg.password.is_none());
    }

    #[test]
    fn rejects_command_with_both_triggers() {
        let err = BridgeConfig::parse(
            "homeserver: https://h.org\nusername: '@b:h.org'\ncommands:\n  - word: a\n    expression: b\n    name: X\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("only one of"));
    }

    #[test]
    fn rejects_command_without_trigger() {
        let err = BridgeConfig::parse(
            "homeserver: https://h.org\nusername: '@b:h.org'\ncommands:\n  - name: X\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("needs a `word`"));
    }

    #[test]
    fn rejects_bad_expression_username_and_homeserver() {
        assert!(
            BridgeConfig::parse(
                "homeserver: https://h.org\nusername: '@b:h.org'\ncommands:\n  - expression: '(x'\n    name: X\n",
            )
            .is_err()
        );
        assert!(BridgeConfig::parse("homeserver: https://h.org\nusername: bot\n").is_err());
        assert!(BridgeConfig::parse("homeserver: ftp://h.org\nusername: '@b:h.org'\n").is_err());
        assert!(BridgeConfig::parse("homeserver: nope\nusername: '@b:h.org'\n").is_err());
    }
}
