use crate::config::Config;

/// The configured agent command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    base_command: Vec<String>,
}

impl AgentCommand {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_command: config
                .effective_command()
                .split_whitespace()
                .map(String::from)
                .collect(),
        }
    }

    fn is_claude(&self) -> bool {
        self.base_command
            .first()
            .map(|s| s.contains("claude"))
            .unwrap_or(true)
    }

    pub fn name(&self) -> &'static str {
        if self.is_claude() {
            "Claude"
        } else {
            "Unknown"
        }
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    /// Arguments after the binary for one headless session.
    pub fn headless_args(&self, prompt: &str, resume: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = self.base_command.iter().skip(1).cloned().collect();
        args.push("-p".to_string());
        args.push(prompt.to_string());
        args.push("--output-format".to_string());
        args.push("json".to_string());
        if let Some(session) = resume {
            args.push("--resume".to_string());
            args.push(session.to_string());
        }
        args
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
