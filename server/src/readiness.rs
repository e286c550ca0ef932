//! Readiness polling for a dev server launched in the background.
//!
//! Each attempt asks the sandbox whether the port is listening. When it is,
//! an HTTP request against loopback decides whether the service actually
//! answers. When it is not, the dev-server process is looked up; a dead
//! process ends the wait early instead of running out the budget.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::sandbox::{RunOptions, Sandbox, SandboxError};

/// Bounded wait for a background server. The wait ends at whichever comes
/// first: `max_attempts` checks or `deadline` since polling started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub port: u16,
    /// Pause after launch before reporting that the wait has begun.
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
    pub deadline: Duration,
    /// Substring identifying the dev-server process in `ps aux`.
    pub process_pattern: String,
    pub probe_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            port: 3000,
            initial_delay: Duration::from_secs(3),
            interval: Duration::from_secs(2),
            max_attempts: 30,
            deadline: Duration::from_secs(75),
            process_pattern: "next dev".to_string(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The HTTP probe answered on the `attempts`-th check.
    Ready { attempts: u32 },
    NotReady { attempts: u32, last_error: Option<String> },
}

enum Probe {
    Answering,
    /// Port is open but the HTTP request did not succeed yet.
    Listening,
    Closed { process_alive: bool },
}

/// Lists listening sockets with `netstat`, then `ss`, then `/proc/net/tcp*`.
/// Prints `not listening` when none of them finds the port.
pub fn port_listing_command(port: u16) -> String {
    format!(
        "netstat -tuln 2>/dev/null | grep ':{port}' || ss -tuln 2>/dev/null | grep ':{port}' || \
         {{ grep -qi ':{port:04X} ' /proc/net/tcp /proc/net/tcp6 2>/dev/null && echo ':{port} (procfs)'; }} || \
         echo 'not listening'"
    )
}

pub fn is_listening(listing: &str, port: u16) -> bool {
    listing.contains(&format!(":{port}")) && !listing.contains("not listening")
}

fn http_probe_command(port: u16) -> String {
    let url = format!("http://127.0.0.1:{port}");
    format!(
        "{{ curl -s -o /dev/null --max-time 4 {url} || wget -q -O /dev/null -T 4 {url}; }} >/dev/null 2>&1 \
         && echo 'ready' || echo 'not ready'"
    )
}

fn process_check_command(pattern: &str) -> String {
    let quoted = shlex::try_quote(pattern).map_or_else(|_| "''".into(), |q| q.into_owned());
    format!("ps aux | grep -v grep | grep {quoted} || echo 'not running'")
}

async fn probe_once(sandbox: &dyn Sandbox, policy: &ReadinessPolicy) -> Result<Probe, SandboxError> {
    let options = RunOptions::default().with_timeout(policy.probe_timeout);

    let listing = sandbox.run(&port_listing_command(policy.port), options.clone()).await?;
    if is_listening(&listing.stdout, policy.port) {
        let http = sandbox.run(&http_probe_command(policy.port), options).await?;
        // exact token: "not ready" also contains "ready"
        return Ok(if http.stdout.trim() == "ready" {
            Probe::Answering
        } else {
            Probe::Listening
        });
    }

    let processes = sandbox.run(&process_check_command(&policy.process_pattern), options).await?;
    Ok(Probe::Closed {
        process_alive: !processes.stdout.contains("not running"),
    })
}

/// Polls until the server answers, its process disappears, or the policy's
/// budget runs out. Probe failures are remembered as the last error and do
/// not end the wait.
pub async fn wait_until_ready(sandbox: &dyn Sandbox, policy: &ReadinessPolicy) -> Readiness {
    let started = Instant::now();
    let mut last_error = None;
    let mut attempts = 0;

    while attempts < policy.max_attempts {
        if started.elapsed() >= policy.deadline {
            debug!(attempts, "readiness deadline reached");
            break;
        }
        sleep(policy.interval).await;
        attempts += 1;

        match probe_once(sandbox, policy).await {
            Ok(Probe::Answering) => {
                info!(port = policy.port, attempts, "dev server is answering");
                return Readiness::Ready { attempts };
            }
            Ok(Probe::Listening) => debug!(attempts, "port open, server not answering yet"),
            Ok(Probe::Closed { process_alive: true }) => debug!(attempts, "port not listening yet"),
            Ok(Probe::Closed { process_alive: false }) => {
                let message = format!("dev server process ({}) not running", policy.process_pattern);
                warn!(attempts, "{message}");
                return Readiness::NotReady {
                    attempts,
                    last_error: Some(message),
                };
            }
            Err(err) => {
                debug!(attempts, error = %err, "readiness probe failed");
                last_error = Some(err.to_string());
            }
        }
    }

    warn!(port = policy.port, attempts, "dev server did not become ready");
    Readiness::NotReady { attempts, last_error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSandbox, Reply};

    fn listening() -> Reply {
        Reply::stdout("tcp   0   0 0.0.0.0:3000   0.0.0.0:*   LISTEN\n")
    }

    #[test]
    fn test_listing_detection() {
        assert!(is_listening("tcp 0 0 :::3000 :::* LISTEN", 3000));
        assert!(!is_listening("not listening\n", 3000));
        assert!(!is_listening("tcp 0 0 0.0.0.0:8080 LISTEN", 3000));
    }

    #[test]
    fn test_port_listing_has_procfs_fallback() {
        let command = port_listing_command(3000);
        assert!(command.contains(":0BB8 "));
        assert!(command.ends_with("echo 'not listening'"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_first_answer() {
        let sandbox = FakeSandbox::new();
        sandbox.on("netstat", listening()).on("curl", Reply::stdout("ready\n"));

        let readiness = wait_until_ready(sandbox.as_ref(), &ReadinessPolicy::default()).await;
        assert_eq!(readiness, Readiness::Ready { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_token_is_not_success() {
        let sandbox = FakeSandbox::new();
        sandbox
            .on("netstat", listening())
            .on_times("curl", 2, Reply::stdout("not ready\n"))
            .on("curl", Reply::stdout("ready\n"));

        let readiness = wait_until_ready(sandbox.as_ref(), &ReadinessPolicy::default()).await;
        assert_eq!(readiness, Readiness::Ready { attempts: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let sandbox = FakeSandbox::new();
        sandbox
            .on("netstat", Reply::stdout("not listening\n"))
            .on("ps aux", Reply::stdout("user 42 node next dev\n"));
        let policy = ReadinessPolicy {
            max_attempts: 7,
            ..ReadinessPolicy::default()
        };

        let readiness = wait_until_ready(sandbox.as_ref(), &policy).await;
        assert_eq!(
            readiness,
            Readiness::NotReady {
                attempts: 7,
                last_error: None
            }
        );
        assert_eq!(sandbox.count_matching("netstat"), 7);
        assert_eq!(sandbox.count_matching("curl"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_the_wait() {
        let sandbox = FakeSandbox::new();
        sandbox
            .on("netstat", Reply::stdout("not listening\n"))
            .on("ps aux", Reply::stdout("user 42 node next dev\n"));
        let policy = ReadinessPolicy {
            interval: Duration::from_secs(10),
            deadline: Duration::from_secs(30),
            ..ReadinessPolicy::default()
        };

        let started = Instant::now();
        let readiness = wait_until_ready(sandbox.as_ref(), &policy).await;
        assert!(matches!(readiness, Readiness::NotReady { attempts: 3, .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_process_stops_early() {
        let sandbox = FakeSandbox::new();
        sandbox
            .on("netstat", Reply::stdout("not listening\n"))
            .on_times("ps aux", 2, Reply::stdout("user 42 node next dev\n"))
            .on("ps aux", Reply::stdout("not running\n"));

        let readiness = wait_until_ready(sandbox.as_ref(), &ReadinessPolicy::default()).await;
        assert_eq!(
            readiness,
            Readiness::NotReady {
                attempts: 3,
                last_error: Some("dev server process (next dev) not running".to_string())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_are_kept_as_last_error() {
        let sandbox = FakeSandbox::new();
        sandbox.on("netstat", Reply::Backend("connection reset".to_string()));
        let policy = ReadinessPolicy {
            max_attempts: 3,
            ..ReadinessPolicy::default()
        };

        let readiness = wait_until_ready(sandbox.as_ref(), &policy).await;
        assert_eq!(
            readiness,
            Readiness::NotReady {
                attempts: 3,
                last_error: Some("connection reset".to_string())
            }
        );
    }
}
