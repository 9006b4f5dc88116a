//! `fixloop` command line.
//!
//! `code` runs one fix attempt for an issue; `review` reviews one pull request.
//! Both are meant to be triggered by repository events, one invocation per
//! event.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use fixloop::code_fix::{CodeFixRequest, Collaborators, run_code_fix};
use fixloop::core::refs::is_repo_slug;
use fixloop::exit_codes;
use fixloop::io::config::{DEFAULT_CONFIG_FILE, EnvVars, Settings, load_settings};
use fixloop::io::hosting::GitHubClient;
use fixloop::io::llm::ChatCompletionsClient;
use fixloop::io::process::SystemRunner;
use fixloop::logging;
use fixloop::review::{ReviewRequest, run_review};

#[derive(Parser)]
#[command(name = "fixloop", version, about = "Automated issue fix and review loop")]
struct Cli {
    /// Settings file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one fix attempt for an issue.
    Code {
        /// Issue number.
        #[arg(long)]
        issue: u64,
        /// Repository holding the issue (`owner/name`); defaults to `GITHUB_REPOSITORY`.
        #[arg(long)]
        agent_repo: Option<String>,
    },
    /// Review one pull request.
    Review {
        /// Repository holding the pull request (`owner/name`).
        #[arg(long)]
        repo: String,
        /// Pull request number.
        #[arg(long)]
        pr: u64,
    },
}

fn main() {
    logging::init("warn,fixloop=info");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let env = EnvVars::capture().context("capture environment")?;
    let settings = load_settings(&cli.config, &env)?;

    let hosting = GitHubClient::new(
        &settings.github.api_base,
        settings.secrets.github_token.clone(),
        settings.github.request_timeout(),
    )?;
    let llm = ChatCompletionsClient::new(&settings.llm, &settings.secrets);
    let runner = SystemRunner::new(settings.commands.output_limit_bytes);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    match cli.command {
        Command::Code { issue, agent_repo } => {
            let agent_repo = resolve_agent_repo(agent_repo, &env, &settings)?;
            let outcome = run_code_fix(
                &collab,
                &settings,
                &CodeFixRequest {
                    agent_repo,
                    issue_number: issue,
                },
            )?;
            println!("{}", outcome.summary());
            Ok(outcome.exit_code())
        }
        Command::Review { repo, pr } => {
            ensure_slug("--repo", &repo)?;
            let outcome = run_review(
                &collab,
                &settings,
                &ReviewRequest {
                    repo,
                    pr_number: pr,
                },
            )?;
            println!("{}", outcome.summary());
            Ok(outcome.exit_code())
        }
    }
}

/// `--agent-repo`, else `GITHUB_REPOSITORY`, else the configured agent repo.
fn resolve_agent_repo(flag: Option<String>, env: &EnvVars, settings: &Settings) -> Result<String> {
    let repo = flag
        .or_else(|| env.get("GITHUB_REPOSITORY").map(str::to_string))
        .or_else(|| settings.github.agent_repo.clone())
        .ok_or_else(|| anyhow!("--agent-repo is required when GITHUB_REPOSITORY is unset"))?;
    ensure_slug("--agent-repo", &repo)?;
    Ok(repo)
}

fn ensure_slug(flag: &str, value: &str) -> Result<()> {
    if is_repo_slug(value) {
        Ok(())
    } else {
        Err(anyhow!("{flag} must be owner/name, got '{value}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_code_command() {
        let cli = Cli::parse_from(["fixloop", "code", "--issue", "12"]);
        assert!(matches!(
            cli.command,
            Command::Code {
                issue: 12,
                agent_repo: None
            }
        ));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_review_command_with_config() {
        let cli = Cli::parse_from([
            "fixloop", "review", "--repo", "acme/widgets", "--pr", "4", "--config", "ci.toml",
        ]);
        assert!(matches!(cli.command, Command::Review { pr: 4, .. }));
        assert_eq!(cli.config, PathBuf::from("ci.toml"));
    }

    #[test]
    fn agent_repo_falls_back_to_environment() {
        let env = EnvVars::from_pairs([("GITHUB_REPOSITORY", "acme/agent")]);
        let settings = Settings::default();
        assert_eq!(
            resolve_agent_repo(None, &env, &settings).expect("repo"),
            "acme/agent"
        );
        assert_eq!(
            resolve_agent_repo(Some("o/n".to_string()), &env, &settings).expect("repo"),
            "o/n"
        );
        assert!(resolve_agent_repo(None, &EnvVars::default(), &settings).is_err());
        assert!(resolve_agent_repo(Some("bad".to_string()), &env, &settings).is_err());
    }
}
