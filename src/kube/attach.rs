use std::io;
use std::path::PathBuf;
use std::process::Command;

use super::Pod;

/// Shell used when no command is given: bash when the image has it, sh otherwise.
pub const DEFAULT_SHELL: &[&str] = &[
    "sh",
    "-c",
    "command -v bash >/dev/null 2>&1 && exec bash || exec sh",
];

/// Interactive terminal into a container; returns the remote command's exit code.
pub trait Attacher: Send + Sync {
    fn attach(&self, pod: &Pod, container: &str, args: &[String]) -> io::Result<i32>;
}

#[derive(Debug, Clone)]
pub struct KubectlAttach {
    kubectl: PathBuf,
}

impl KubectlAttach {
    pub fn new(kubectl: PathBuf) -> Self {
        Self { kubectl }
    }

    fn exec_args(pod: &Pod, container: &str, args: &[String]) -> Vec<String> {
        let mut out: Vec<String> = vec![
            "exec".into(),
            "-it".into(),
            "-n".into(),
            pod.namespace().to_string(),
            pod.name().to_string(),
            "-c".into(),
            container.to_string(),
            "--".into(),
        ];
        if args.is_empty() {
            out.extend(DEFAULT_SHELL.iter().map(|s| s.to_string()));
        } else {
            out.extend(args.iter().cloned());
        }
        out
    }
}

impl Attacher for KubectlAttach {
    fn attach(&self, pod: &Pod, container: &str, args: &[String]) -> io::Result<i32> {
        let argv = Self::exec_args(pod, container, args);
        tracing::debug!(target: "devspace.attach", cmd = %crate::util::shell_join(&argv));
        let status = Command::new(&self.kubectl).args(&argv).status()?;
        Ok(status.code().unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> Pod {
        let mut p = Pod::default();
        p.metadata.name = "web-0".into();
        p.metadata.namespace = "dev".into();
        p
    }

    #[test]
    fn test_exec_args_default_shell() {
        let argv = KubectlAttach::exec_args(&pod(), "app", &[]);
        assert_eq!(&argv[..8], ["exec", "-it", "-n", "dev", "web-0", "-c", "app", "--"]);
        assert_eq!(argv[8], "sh");
        assert!(argv[10].contains("exec bash"));
    }

    #[test]
    fn test_exec_args_passes_command() {
        let argv = KubectlAttach::exec_args(&pod(), "app", &["npm".into(), "test".into()]);
        assert_eq!(argv[argv.len() - 2..], ["npm".to_string(), "test".to_string()]);
    }
}
