//! Shell resolution: map a shell kind to an executable, arguments, and
//! environment.

use std::str::FromStr;
use wmx_core::{WmxError, WmxResult};

/// The closed set of supported shells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShellKind {
    Bash,
    Zsh,
    Fish,
    Sh,
    Pwsh,
    PowerShell,
    Cmd,
}

impl ShellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Zsh => "zsh",
            Self::Fish => "fish",
            Self::Sh => "sh",
            Self::Pwsh => "pwsh",
            Self::PowerShell => "powershell",
            Self::Cmd => "cmd",
        }
    }
}

impl std::fmt::Display for ShellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShellKind {
    type Err = WmxError;

    fn from_str(s: &str) -> WmxResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bash" => Ok(Self::Bash),
            "zsh" => Ok(Self::Zsh),
            "fish" => Ok(Self::Fish),
            "sh" => Ok(Self::Sh),
            "pwsh" => Ok(Self::Pwsh),
            "powershell" => Ok(Self::PowerShell),
            "cmd" => Ok(Self::Cmd),
            other => Err(WmxError::Other(format!("unsupported shell type: {other}"))),
        }
    }
}

/// A resolved shell: what to execute and how.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub kind: ShellKind,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Resolve a shell configuration: explicit request wins, then the configured
/// default, then the platform default.
pub fn resolve_shell(requested: Option<ShellKind>, default: Option<ShellKind>) -> ShellConfig {
    let kind = requested.or(default).unwrap_or_else(platform_default);
    config_for(kind)
}

/// The platform's default shell. On Unix this honors `$SHELL` when it names
/// a supported shell.
pub fn platform_default() -> ShellKind {
    #[cfg(unix)]
    {
        if let Ok(shell) = std::env::var("SHELL") {
            let name = shell.rsplit('/').next().unwrap_or("");
            if let Ok(kind) = name.parse::<ShellKind>() {
                return kind;
            }
        }
        ShellKind::Sh
    }
    #[cfg(windows)]
    {
        ShellKind::Pwsh
    }
}

fn config_for(kind: ShellKind) -> ShellConfig {
    let env = vec![
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
    ];
    let (program, args) = match kind {
        ShellKind::Bash => ("bash", vec![]),
        ShellKind::Zsh => ("zsh", vec![]),
        ShellKind::Fish => ("fish", vec![]),
        ShellKind::Sh => ("sh", vec![]),
        ShellKind::Pwsh => ("pwsh", vec!["-NoLogo".to_string()]),
        ShellKind::PowerShell => ("powershell", vec!["-NoLogo".to_string()]),
        ShellKind::Cmd => ("cmd", vec![]),
    };
    ShellConfig {
        kind,
        program: program.to_string(),
        args,
        env,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("Bash".parse::<ShellKind>().unwrap(), ShellKind::Bash);
        assert_eq!("PWSH".parse::<ShellKind>().unwrap(), ShellKind::Pwsh);
        assert_eq!("powershell".parse::<ShellKind>().unwrap(), ShellKind::PowerShell);
    }

    #[test]
    fn unknown_shell_rejected() {
        assert!("tcsh".parse::<ShellKind>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for kind in [
            ShellKind::Bash,
            ShellKind::Zsh,
            ShellKind::Fish,
            ShellKind::Sh,
            ShellKind::Pwsh,
            ShellKind::PowerShell,
            ShellKind::Cmd,
        ] {
            assert_eq!(kind.to_string().parse::<ShellKind>().unwrap(), kind);
        }
    }

    #[test]
    fn explicit_request_wins() {
        let config = resolve_shell(Some(ShellKind::Fish), Some(ShellKind::Bash));
        assert_eq!(config.kind, ShellKind::Fish);
        assert_eq!(config.program, "fish");
    }

    #[test]
    fn shell_env_sets_term() {
        let config = resolve_shell(Some(ShellKind::Bash), None);
        assert!(config
            .env
            .iter()
            .any(|(k, v)| k == "TERM" && v == "xterm-256color"));
    }
}
