use std::collections::BTreeMap;

use rave_core::{time, Error, Result};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, warn};

const MAX_COMMAND_LENGTH: usize = 1000;
const MAX_ARGUMENT_LENGTH: usize = 200;

/// A parsed and validated chat command.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedCommand {
    pub command: String,
    pub args: Vec<String>,
    pub raw_command: String,
    pub metadata: CommandMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandMetadata {
    pub parsed_at: f64,
    pub validation_passed: bool,
    pub arg_count: usize,
}

/// Help information for one allowlisted command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandHelp {
    pub command: String,
    pub description: String,
    pub usage: String,
    pub min_args: usize,
    pub max_args: usize,
}

struct CommandSpec {
    pattern: &'static str,
    min_args: usize,
    max_args: usize,
    arg_patterns: &'static [&'static str],
    description: &'static str,
    usage: &'static str,
}

const COMMAND_SPECS: [(&str, CommandSpec); 5] = [
    (
        "start-agent",
        CommandSpec {
            pattern: r"^!start-agent\s+([a-zA-Z0-9_-]+)(?:\s+(.*))?$",
            min_args: 1,
            max_args: 2,
            arg_patterns: &[r"^[a-zA-Z0-9_-]{1,50}$", r"^[a-zA-Z0-9=,\s_-]{0,200}$"],
            description: "Start an agent service",
            usage: "!start-agent <agent-type> [config]",
        },
    ),
    (
        "stop-agent",
        CommandSpec {
            pattern: r"^!stop-agent\s+([a-zA-Z0-9_-]+)$",
            min_args: 1,
            max_args: 1,
            arg_patterns: &[r"^[a-zA-Z0-9_-]{1,50}$"],
            description: "Stop an agent service",
            usage: "!stop-agent <agent-type>",
        },
    ),
    (
        "status-agent",
        CommandSpec {
            pattern: r"^!status-agent\s+([a-zA-Z0-9_-]+)$",
            min_args: 1,
            max_args: 1,
            arg_patterns: &[r"^[a-zA-Z0-9_-]{1,50}$"],
            description: "Get agent service status",
            usage: "!status-agent <agent-type>",
        },
    ),
    (
        "list-agents",
        CommandSpec {
            pattern: r"^!list-agents(?:\s+([a-zA-Z0-9_-]+))?$",
            min_args: 0,
            max_args: 1,
            arg_patterns: &[r"^[a-zA-Z0-9_-]{1,20}$"],
            description: "List available agents",
            usage: "!list-agents [filter]",
        },
    ),
    (
        "help",
        CommandSpec {
            pattern: r"^!help(?:\s+([a-zA-Z0-9_-]+))?$",
            min_args: 0,
            max_args: 1,
            arg_patterns: &[r"^[a-zA-Z0-9_-]{1,20}$"],
            description: "Show help information",
            usage: "!help [command]",
        },
    ),
];

// Inputs matching any of these are rejected outright. HTML escaping runs
// first, so any raw <, >, &, or quote also trips the metacharacter class
// via its escaped entity.
const DANGEROUS_PATTERNS: [&str; 14] = [
    r"[;&|`$(){}\[\]\\]",     // shell metacharacters
    r"\.\.",                  // directory traversal
    r"\.\..*/",               // traversal with forward slash
    r"\.\..*\\",              // traversal with backslash
    r"/[a-zA-Z]",             // absolute paths
    r"<[^>]*>",               // HTML/XML tags
    r"javascript:",           // javascript URLs
    r"<script.*?>",           // script tags
    r"data:",                 // data URLs
    r"file://",               // file URLs
    r"\\x[0-9a-fA-F]{2}",     // hex escape sequences
    r"%[0-9a-fA-F]{2}",       // URL encoding
    r"\r|\n",                 // line breaks
    r"[\x00-\x1f\x7f-\x9f]",  // control characters
];

/// Allowlist-driven command parser with layered validation.
///
/// Ordering matters: length and prefix checks, HTML escaping, dangerous
/// pattern screening, shell tokenization, allowlist membership, canonical
/// pattern match, argument count and per-argument patterns, then argument
/// sanitization.
pub struct CommandParser {
    allowed: Vec<String>,
    dangerous: Vec<Regex>,
    canonical: BTreeMap<&'static str, Regex>,
    arg_patterns: BTreeMap<&'static str, Vec<Regex>>,
}

impl CommandParser {
    /// Build a parser allowing the given commands, or every known command
    /// when `allowed_commands` is `None`.
    pub fn new(allowed_commands: Option<&[String]>) -> Result<Self> {
        let known: Vec<&str> = COMMAND_SPECS.iter().map(|(name, _)| *name).collect();

        let allowed: Vec<String> = match allowed_commands {
            None => known.iter().map(|s| s.to_string()).collect(),
            Some(list) => {
                let unknown: Vec<&String> =
                    list.iter().filter(|c| !known.contains(&c.as_str())).collect();
                if !unknown.is_empty() {
                    return Err(Error::validation(format!(
                        "unknown commands in allowed list: {unknown:?}"
                    )));
                }
                list.to_vec()
            }
        };

        let dangerous = DANGEROUS_PATTERNS
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .multi_line(true)
                    .build()
                    .map_err(|e| Error::internal(format!("bad dangerous pattern {p}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut canonical = BTreeMap::new();
        let mut arg_patterns = BTreeMap::new();
        for (name, spec) in &COMMAND_SPECS {
            let pattern = RegexBuilder::new(spec.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| Error::internal(format!("bad command pattern: {e}")))?;
            canonical.insert(*name, pattern);
            let args = spec
                .arg_patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| Error::internal(format!("bad arg pattern: {e}")))
                })
                .collect::<Result<Vec<_>>>()?;
            arg_patterns.insert(*name, args);
        }

        Ok(Self {
            allowed,
            dangerous,
            canonical,
            arg_patterns,
        })
    }

    /// Parse and validate a raw chat message into a command.
    pub fn parse(&self, command_text: &str) -> Result<ParsedCommand> {
        let original = command_text.to_string();
        debug!(command = %truncate(command_text, 100), "parsing command");

        let result = self.parse_inner(command_text, &original);
        if let Err(e) = &result {
            warn!(
                error = %e,
                command = %truncate(command_text, 100),
                "command validation failed"
            );
        }
        result
    }

    fn parse_inner(&self, command_text: &str, original: &str) -> Result<ParsedCommand> {
        let text = self.basic_validation(command_text)?;
        self.check_dangerous_patterns(&text)?;

        let (command, args) = parse_structure(&text)?;

        if !self.allowed.iter().any(|c| c == &command) {
            return Err(Error::validation(format!("command not allowed: {command}")));
        }

        let spec = spec_for(&command)
            .ok_or_else(|| Error::validation(format!("unknown command: {command}")))?;
        let canonical = &self.canonical[command.as_str()];
        if !canonical.is_match(&text) {
            return Err(Error::validation(format!(
                "command syntax error for {command}"
            )));
        }

        if args.len() < spec.min_args {
            return Err(Error::validation(format!(
                "too few arguments for {command} (min: {})",
                spec.min_args
            )));
        }
        if args.len() > spec.max_args {
            return Err(Error::validation(format!(
                "too many arguments for {command} (max: {})",
                spec.max_args
            )));
        }

        let patterns = &self.arg_patterns[command.as_str()];
        let mut validated = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            if let Some(pattern) = patterns.get(i) {
                if !pattern.is_match(arg) {
                    return Err(Error::validation(format!(
                        "invalid argument {} for {command}: {arg}",
                        i + 1
                    )));
                }
            }
            validated.push(sanitize_argument(arg)?);
        }

        let arg_count = validated.len();
        Ok(ParsedCommand {
            command,
            args: validated,
            raw_command: original.to_string(),
            metadata: CommandMetadata {
                parsed_at: time::unix_now(),
                validation_passed: true,
                arg_count,
            },
        })
    }

    fn basic_validation(&self, command_text: &str) -> Result<String> {
        if command_text.len() > MAX_COMMAND_LENGTH {
            return Err(Error::validation("command too long (max 1000 characters)"));
        }
        let trimmed = command_text.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("empty command"));
        }
        if !trimmed.starts_with('!') {
            return Err(Error::validation("commands must start with !"));
        }

        // HTML-escape so the text is safe to log and echo; escaping also
        // feeds raw markup into the dangerous-pattern screen below.
        let escaped = html_escape::encode_safe(trimmed).into_owned();
        let collapsed = collapse_whitespace(&escaped);
        Ok(collapsed)
    }

    fn check_dangerous_patterns(&self, text: &str) -> Result<()> {
        for pattern in &self.dangerous {
            if pattern.is_match(text) {
                return Err(Error::validation(format!(
                    "dangerous pattern detected: {}",
                    pattern.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Allowed commands and their descriptions.
    pub fn allowed_commands(&self) -> BTreeMap<String, String> {
        self.allowed
            .iter()
            .filter_map(|c| spec_for(c).map(|s| (c.clone(), s.description.to_string())))
            .collect()
    }

    /// Help info for one command, if allowed.
    pub fn command_help(&self, command: &str) -> Option<CommandHelp> {
        if !self.allowed.iter().any(|c| c == command) {
            return None;
        }
        spec_for(command).map(|spec| CommandHelp {
            command: command.to_string(),
            description: spec.description.to_string(),
            usage: spec.usage.to_string(),
            min_args: spec.min_args,
            max_args: spec.max_args,
        })
    }

    /// Validate an agent name outside of full command parsing.
    pub fn validate_agent_name(&self, agent_name: &str) -> bool {
        !agent_name.is_empty()
            && agent_name.len() <= 50
            && agent_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

fn spec_for(command: &str) -> Option<&'static CommandSpec> {
    COMMAND_SPECS
        .iter()
        .find(|(name, _)| *name == command)
        .map(|(_, spec)| spec)
}

fn parse_structure(text: &str) -> Result<(String, Vec<String>)> {
    let parts = shlex::split(text)
        .ok_or_else(|| Error::validation("invalid command syntax: unbalanced quoting"))?;
    let (first, rest) = parts
        .split_first()
        .ok_or_else(|| Error::validation("empty command"))?;
    let command = first.trim_start_matches('!').to_lowercase();
    Ok((command, rest.to_vec()))
}

fn sanitize_argument(arg: &str) -> Result<String> {
    let cleaned: String = arg.chars().filter(|c| *c != '\0').collect();
    if cleaned.len() > MAX_ARGUMENT_LENGTH {
        return Err(Error::validation(format!(
            "argument too long: {}...",
            truncate(&cleaned, 50)
        )));
    }
    Ok(cleaned.trim().to_string())
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
