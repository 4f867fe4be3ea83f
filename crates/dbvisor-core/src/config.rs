use crate::error::SupervisorError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A single command-line argument.
///
/// Arguments are handed to the OS as-is, so an argument containing spaces always reaches
/// the child as one token. Quoting only applies to the rendered command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Plain(String),
    /// `name` and `value` joined by a literal `separator`, e.g. `--datadir=/var/lib/db`.
    /// Each side is quoted on its own when rendered.
    Pair {
        name: String,
        separator: String,
        value: String,
    },
}

impl Argument {
    /// The exact value passed to the child process
    pub fn to_os_arg(&self) -> String {
        match self {
            Argument::Plain(arg) => arg.clone(),
            Argument::Pair {
                name,
                separator,
                value,
            } => format!("{name}{separator}{value}"),
        }
    }

    /// Shell-style rendering used for diagnostics
    pub fn to_display(&self) -> String {
        match self {
            Argument::Plain(arg) => quote_argument(arg).into_owned(),
            Argument::Pair {
                name,
                separator,
                value,
            } => format!(
                "{}{separator}{}",
                quote_argument(name),
                quote_argument(value)
            ),
        }
    }
}

/// Quotes an argument for display if it contains whitespace.
///
/// Double quotes are used unless the argument itself contains one, in which case single
/// quotes are used. Arguments that are already quoted are left alone.
pub fn quote_argument(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        return Cow::Borrowed("\"\"");
    }

    let already_quoted = arg.len() >= 2
        && ((arg.starts_with('"') && arg.ends_with('"'))
            || (arg.starts_with('\'') && arg.ends_with('\'')));
    if already_quoted || !arg.chars().any(char::is_whitespace) {
        return Cow::Borrowed(arg);
    }

    match (arg.contains('"'), arg.contains('\'')) {
        (false, _) => Cow::Owned(format!("\"{arg}\"")),
        (true, false) => Cow::Owned(format!("'{arg}'")),
        (true, true) => Cow::Owned(format!("\"{}\"", arg.replace('"', "\\\""))),
    }
}

/// Name of the environment variable holding the native library search path
pub fn library_path_variable() -> &'static str {
    if cfg!(windows) {
        "PATH"
    } else if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// Everything needed to spawn the supervised process
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(
    setter(into, strip_option),
    build_fn(private, name = "build_unchecked")
)]
pub struct ProcessSpec {
    executable: PathBuf,
    #[builder(default, setter(custom))]
    args: Vec<Argument>,
    #[builder(default, setter(custom))]
    environment: HashMap<String, String>,
    #[builder(default)]
    working_directory: Option<PathBuf>,
    #[builder(default)]
    stdin: Option<Vec<u8>>,
    #[builder(default = "vec![0]", setter(custom))]
    success_exit_codes: Vec<i32>,
}

impl ProcessSpec {
    pub fn builder() -> ProcessSpecBuilder {
        ProcessSpecBuilder::default()
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    /// Arguments exactly as the child receives them
    pub fn argv(&self) -> Vec<String> {
        self.args.iter().map(Argument::to_os_arg).collect()
    }

    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    pub fn stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    pub fn is_success(&self, code: i32) -> bool {
        self.success_exit_codes.contains(&code)
    }

    /// Executable basename, e.g. `mysqld`
    pub fn short_name(&self) -> String {
        self.executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.to_string_lossy().into_owned())
    }

    /// Quoted command line
    pub fn command_line(&self) -> String {
        let executable = self.executable.to_string_lossy();
        std::iter::once(quote_argument(&executable).into_owned())
            .chain(self.args.iter().map(Argument::to_display))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Command line plus working directory, for diagnostics
    pub fn long_name(&self) -> String {
        format!("{} (in {})", self.command_line(), self.working_directory_display())
    }

    pub fn working_directory_display(&self) -> String {
        self.working_directory
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| "<unset>".to_string())
    }
}

impl ProcessSpecBuilder {
    pub fn arg<S: ToString>(&mut self, arg: S) -> &mut Self {
        self.args
            .get_or_insert_with(Vec::new)
            .push(Argument::Plain(arg.to_string()));
        self
    }

    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args = self.args.get_or_insert_with(Vec::new);
        args.extend(iter.into_iter().map(|s| Argument::Plain(s.to_string())));
        self
    }

    /// Adds `name` + `separator` + `value` as one argument, e.g. `--datadir=<path>`
    pub fn arg_pair<N: ToString, S: ToString, V: ToString>(
        &mut self,
        name: N,
        separator: S,
        value: V,
    ) -> &mut Self {
        self.args.get_or_insert_with(Vec::new).push(Argument::Pair {
            name: name.to_string(),
            separator: separator.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.environment.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.environment.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Points the platform's native library search path variable at `dir`
    pub fn library_path<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        let value = dir.as_ref().to_string_lossy().into_owned();
        self.environment
            .get_or_insert_with(HashMap::new)
            .insert(library_path_variable().to_string(), value);
        self
    }

    pub fn success_exit_codes<I: IntoIterator<Item = i32>>(&mut self, codes: I) -> &mut Self {
        self.success_exit_codes = Some(codes.into_iter().collect());
        self
    }

    /// Builds the spec, deriving the working directory from the executable's parent when
    /// none was given.
    pub fn build(&self) -> Result<ProcessSpec, SupervisorError> {
        let mut spec = self
            .build_unchecked()
            .map_err(|e| SupervisorError::Configuration(e.to_string()))?;

        if spec.working_directory.is_none() {
            let derived = spec
                .executable
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .ok_or_else(|| {
                    SupervisorError::Configuration(format!(
                        "no working directory given and none can be derived from executable {}",
                        spec.executable.display()
                    ))
                })?;
            spec.working_directory = Some(derived);
        }

        Ok(spec)
    }
}

/// Tuning for one [`ProcessSpec`] under supervision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Number of recent console lines kept for diagnostics
    #[serde(default = "default_console_buffer_max_lines")]
    pub console_buffer_max_lines: usize,

    /// How long `destroy()` waits for the killed process to be reaped (in milliseconds)
    #[serde(default = "default_destroy_timeout_ms")]
    pub destroy_timeout_ms: u64,

    /// How long the exit observer waits for the output pumps to drain after exit (in milliseconds)
    #[serde(default = "default_output_drain_timeout_ms")]
    pub output_drain_timeout_ms: u64,

    /// Kill the process if the supervisor is dropped while it is still alive
    #[serde(default = "default_destroy_on_drop")]
    pub destroy_on_drop: bool,

    /// Register the process with the cleanup registry, if one is attached
    #[serde(default = "default_destroy_on_shutdown")]
    pub destroy_on_shutdown: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            console_buffer_max_lines: default_console_buffer_max_lines(),
            destroy_timeout_ms: default_destroy_timeout_ms(),
            output_drain_timeout_ms: default_output_drain_timeout_ms(),
            destroy_on_drop: default_destroy_on_drop(),
            destroy_on_shutdown: default_destroy_on_shutdown(),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.console_buffer_max_lines == 0 {
            return Err(anyhow::anyhow!(
                "console_buffer_max_lines must keep at least one line"
            ));
        }

        if self.destroy_timeout_ms == 0 {
            return Err(anyhow::anyhow!("destroy_timeout_ms must be greater than zero"));
        }

        Ok(())
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }

    pub fn output_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.output_drain_timeout_ms)
    }
}

/// Attempt budget for one-shot installation processes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallRetryConfig {
    /// Total number of attempts (1 means a single attempt and no retry bookkeeping)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Time budget of each attempt (in milliseconds)
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Pause between a failed attempt and the next one (in milliseconds)
    #[serde(default)]
    pub retry_delay_ms: u64,
}

impl Default for InstallRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            retry_delay_ms: 0,
        }
    }
}

impl InstallRetryConfig {
    pub fn new(max_attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts,
            attempt_timeout_ms: attempt_timeout.as_millis() as u64,
            ..Default::default()
        }
    }

    /// One attempt with the default timeout
    pub fn single_attempt() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be at least 1"));
        }

        if self.max_attempts > 10 {
            return Err(anyhow::anyhow!(
                "max_attempts should not exceed 10 to avoid excessive retries"
            ));
        }

        if self.attempt_timeout_ms == 0 {
            return Err(anyhow::anyhow!("attempt_timeout_ms must be greater than zero"));
        }

        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 1
    }
}

// Default value functions for serde
fn default_console_buffer_max_lines() -> usize {
    200
}
fn default_destroy_timeout_ms() -> u64 {
    10_000
}
fn default_output_drain_timeout_ms() -> u64 {
    1_000
}
fn default_destroy_on_drop() -> bool {
    true
}
fn default_destroy_on_shutdown() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    1
}
fn default_attempt_timeout_ms() -> u64 {
    60_000
}
