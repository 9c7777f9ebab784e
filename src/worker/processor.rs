//! External image processor invocation.
//!
//! The processor is a pre-built executable called as
//! `<program> <input> <output> [passes]` with the thread count passed
//! through an environment variable. It may print a timing line such as
//! `Compute kernel (grayscale + sobel) ×1: 0.0123 s`, which is parsed into
//! a kernel-time measurement.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use crate::error::ProcessorError;

/// One processor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub passes: Option<u32>,
    pub threads: u32,
}

/// Captured result of a successful invocation.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time of the invocation.
    pub elapsed: Duration,
}

impl ProcessOutput {
    /// Kernel time reported on stdout, in seconds.
    pub fn kernel_time(&self) -> Option<f64> {
        parse_kernel_time(&self.stdout)
    }
}

/// Runs the image transformation.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Runs once. A non-zero exit is returned as
    /// [`ProcessorError::NonZeroExit`].
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput, ProcessorError>;
}

/// Configuration for [`CommandProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub program: PathBuf,
    /// Environment variable that carries the thread count.
    pub thread_var: String,
    /// Per-run timeout; the child is killed when it expires.
    pub timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/usr/local/bin/grayscale"),
            thread_var: "OMP_NUM_THREADS".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl ProcessorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_thread_var(mut self, var: impl Into<String>) -> Self {
        self.thread_var = var.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Runs the processor as a child process.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    config: ProcessorConfig,
}

impl CommandProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn command(&self, request: &ProcessRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.arg(&request.input).arg(&request.output);
        if let Some(passes) = request.passes {
            cmd.arg(passes.to_string());
        }
        cmd.env(&self.config.thread_var, request.threads.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput, ProcessorError> {
        let program = self.config.program.display().to_string();
        let start = Instant::now();

        let child = self
            .command(request)
            .spawn()
            .map_err(|source| ProcessorError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Dropping the wait future on timeout kills the child.
        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProcessorError::Timeout {
                    seconds: self.config.timeout.as_secs(),
                })
            }
        };
        let elapsed = start.elapsed();

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(
            program = %program,
            threads = request.threads,
            exit_code = exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "Processor finished"
        );

        if !output.status.success() {
            return Err(ProcessorError::NonZeroExit {
                code: exit_code,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
            elapsed,
        })
    }
}

fn kernel_time_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)kernel[^:\n]*:\s*([0-9]*\.?[0-9]+)\s*s\b")
            .expect("Invalid regex for kernel time")
    })
}

/// Extracts the kernel time in seconds from processor stdout.
pub fn parse_kernel_time(stdout: &str) -> Option<f64> {
    kernel_time_pattern()
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_time() {
        assert_eq!(
            parse_kernel_time("Compute kernel (grayscale + sobel) ×4: 0.0123 s\n"),
            Some(0.0123)
        );
        assert_eq!(
            parse_kernel_time("loading\nCompute kernel (grayscale) ×1: 2.5000 s\nsaved\n"),
            Some(2.5)
        );
        assert_eq!(parse_kernel_time("no timing here"), None);
        assert_eq!(parse_kernel_time(""), None);
    }

    #[test]
    fn test_processor_config_builder() {
        let config = ProcessorConfig::new("/opt/bin/sobel")
            .with_thread_var("THREADS")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(config.program, PathBuf::from("/opt/bin/sobel"));
        assert_eq!(config.thread_var, "THREADS");
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let processor =
            CommandProcessor::new(ProcessorConfig::new("/nonexistent/imagepipe-processor"));
        let request = ProcessRequest {
            input: PathBuf::from("in.png"),
            output: PathBuf::from("out.png"),
            passes: None,
            threads: 1,
        };

        let err = processor.run(&request).await.expect_err("missing binary");
        assert!(matches!(err, ProcessorError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_script_with_thread_variable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().expect("tempdir");
        let script = dir.path().join("proc.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncp \"$1\" \"$2\"\necho \"Compute kernel (test) x1: 0.5000 s threads=$OMP_NUM_THREADS\"\n",
        )
        .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let input = dir.path().join("in.png");
        let output = dir.path().join("out.png");
        std::fs::write(&input, b"pixels").expect("write input");

        let processor = CommandProcessor::new(ProcessorConfig::new(&script));
        let result = processor
            .run(&ProcessRequest {
                input,
                output: output.clone(),
                passes: None,
                threads: 3,
            })
            .await
            .expect("run");

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.kernel_time(), Some(0.5));
        assert!(result.stdout.contains("threads=3"));
        assert_eq!(std::fs::read(&output).expect("output"), b"pixels".to_vec());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().expect("tempdir");
        let script = dir.path().join("fail.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'cannot load image' >&2\nexit 2\n")
            .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let processor = CommandProcessor::new(ProcessorConfig::new(&script));
        let err = processor
            .run(&ProcessRequest {
                input: dir.path().join("in.png"),
                output: dir.path().join("out.png"),
                passes: Some(2),
                threads: 1,
            })
            .await
            .expect_err("exit 2");

        match err {
            ProcessorError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "cannot load image");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
