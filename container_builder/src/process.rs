use std::{borrow::Cow, ffi::OsStr, fmt, io, num::NonZeroI32, process};

use log::{debug, log_enabled, Level};

/// The variable and value merged into the child environment when the standard locale is requested.
pub const STANDARD_LOCALE: (&str, &str) = ("LC_ALL", "C");

/// Describes a single subprocess run: the argument vector, the environment overrides and how the
/// result should be judged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub use_standard_locale: bool,
    pub check_exit_code: bool,
}

impl Invocation {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn standard_locale(mut self) -> Self {
        self.use_standard_locale = true;
        self
    }

    pub fn checked(mut self) -> Self {
        self.check_exit_code = true;
        self
    }

    /// The variables to set on top of the parent environment, in the order they must be applied.
    pub fn environment(&self) -> impl Iterator<Item = (&str, &str)> {
        self.use_standard_locale
            .then_some(STANDARD_LOCALE)
            .into_iter()
            .chain(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// The argument vector as a line that can be pasted into a POSIX shell.
    pub fn display(&self) -> String {
        self.argv
            .iter()
            .map(|arg| quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote(arg: &str) -> Cow<'_, str> {
    let inert = |c: char| c.is_ascii_alphanumeric() || matches!(c, ',' | '.' | '/' | '_' | '-' | ':' | '=' | '@' | '+');
    if arg.is_empty() {
        Cow::Borrowed("''")
    } else if arg.chars().all(inert) {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs invocations. Implemented by [`SystemExecutor`] for real subprocesses.
pub trait Execute: Send + Sync {
    fn execute(&self, invocation: &Invocation) -> Result<Output>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Execute for SystemExecutor {
    fn execute(&self, invocation: &Invocation) -> Result<Output> {
        let Some((program, args)) = invocation.argv.split_first() else {
            return Err(Error {
                command: String::new(),
                kind: ErrorKind::EmptyCommand,
            });
        };

        let output = Command::new(program)
            .args(args.iter().map(OsStr::new))
            .envs(invocation.environment())
            .try_output()?;

        let output = Output {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        log_output(invocation, &output);

        if invocation.check_exit_code && !output.success() {
            return Err(Error::non_zero_exit(invocation, &output));
        }

        Ok(output)
    }
}

fn log_output(invocation: &Invocation, output: &Output) {
    if !log_enabled!(Level::Debug) {
        return;
    }
    debug!("ran `{}`", invocation.display());
    if !output.stdout.is_empty() {
        debug!("stdout:\n{}", output.stdout.trim_end());
    }
    if !output.stderr.is_empty() {
        debug!("stderr:\n{}", output.stderr.trim_end());
    }
}

struct Command(process::Command);

impl Command {
    fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self(process::Command::new(program))
    }

    fn args<'a, I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = &'a OsStr>,
    {
        self.0.args(args);
        self
    }

    fn envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.0.envs(vars);
        self
    }

    fn summary(&self) -> String {
        std::iter::once(self.0.get_program())
            .chain(self.0.get_args())
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn try_output(mut self) -> Result<process::Output> {
        if log_enabled!(Level::Debug) {
            debug!("capturing `{command:?}`...", command = &self.0);
        }

        self.0.output().map_err(|error| Error {
            command: self.summary(),
            kind: error.into(),
        })
    }
}

#[derive(Debug)]
pub enum ErrorKind {
    EmptyCommand,
    NotFound,
    PermissionDenied,
    Spawn(io::Error),
    NonZeroExitStatus {
        code: Option<NonZeroI32>,
        stderr: String,
    },
}

impl From<io::Error> for ErrorKind {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::Spawn(value),
        }
    }
}

#[derive(Debug)]
pub struct Error {
    /// The argument vector, quoted for a shell.
    pub command: String,
    pub kind: ErrorKind,
}

impl Error {
    pub fn non_zero_exit(invocation: &Invocation, output: &Output) -> Self {
        Error {
            command: invocation.display(),
            kind: ErrorKind::NonZeroExitStatus {
                code: output.exit_code.and_then(NonZeroI32::new),
                stderr: output.stderr.clone(),
            },
        }
    }

    /// The exit code of a process that ran but failed, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self.kind {
            ErrorKind::NonZeroExitStatus { code, .. } => code.map(NonZeroI32::get),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let ErrorKind::EmptyCommand = self.kind {
            return f.write_str("can not run an empty command");
        }
        write!(f, "failed to run `{command}`: ", command = self.command)?;
        let program = self.command.split(' ').next().unwrap_or_default();
        match &self.kind {
            ErrorKind::EmptyCommand => Ok(()),
            ErrorKind::NotFound => {
                write!(f, "the `{program}` command is required but not available on your system, please install it")
            }
            ErrorKind::PermissionDenied => {
                write!(f, "the `{program}` command is available but does not have the right permissions, please make sure the binary is executable")
            }
            ErrorKind::Spawn(error) => write!(f, "{error}"),
            ErrorKind::NonZeroExitStatus { code, stderr } => {
                match code {
                    Some(code) => write!(f, "exited with non-zero exit code `{code}`")?,
                    None => write!(f, "did not run succesfully")?,
                }
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Spawn(error) => Some(error),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
