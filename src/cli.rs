use std::path::PathBuf;

use clap::Parser;

use crate::config::{
    DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS, DEFAULT_MAX_CONCURRENCY, DEFAULT_MIN_CONCURRENCY,
    DEFAULT_SOFT_TIMEOUT_SECONDS,
};

const BUILD_VERSION: &str = env!("SIDEKIQ_CLUSTER_BUILD_VERSION");
const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
USAGE:
  {usage}

ARGUMENTS:
{positionals}

OPTIONS:
{options}
{after-help}
";
const HELP_AFTER: &str = "\
Queue groups
  Each argument starts one worker. An argument is a comma separated list of
  queues, a queue namespace (expanded to every queue inside it), or `*` for
  every known queue. With --queue-selector each argument is an attribute
  query such as `feature_category=source_code&urgency=high|name=mailers`.

Examples
  sidekiq-cluster 'post_receive,merge' '*'
  sidekiq-cluster --queue-selector 'resource_boundary=cpu' 'urgency!=high'
  sidekiq-cluster --negate mailers -m 10 --list-queues
";

#[derive(Debug, Parser)]
#[command(
    name = "sidekiq-cluster",
    version = BUILD_VERSION,
    about = "Starts and supervises a cluster of Sidekiq worker processes",
    help_template = HELP_TEMPLATE,
    after_help = HELP_AFTER
)]
pub struct Cli {
    /// Queue groups, one worker per group.
    #[arg(value_name = "QUEUE,QUEUE")]
    pub queues: Vec<String>,
    /// Maximum threads to use with Sidekiq (0 to disable).
    #[arg(short = 'm', long = "max-concurrency", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: u32,
    /// Minimum threads to use with Sidekiq.
    #[arg(long = "min-concurrency", default_value_t = DEFAULT_MIN_CONCURRENCY)]
    pub min_concurrency: u32,
    /// The application environment [default: $RAILS_ENV or development].
    #[arg(short = 'e', long)]
    pub environment: Option<String>,
    /// Path to the PID file.
    #[arg(short = 'P', long)]
    pub pidfile: Option<PathBuf>,
    /// Location of the Rails application [default: current directory].
    #[arg(short = 'r', long = "require", value_name = "PATH")]
    pub rails_path: Option<PathBuf>,
    /// Treat every queue group as a worker attribute query.
    #[arg(long = "queue-selector")]
    pub queue_selector: bool,
    /// Run workers for all queues except the given ones.
    #[arg(short = 'n', long)]
    pub negate: bool,
    /// Seconds between worker checks.
    #[arg(short = 'i', long, default_value_t = DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS)]
    pub interval: u64,
    /// Graceful timeout for all running processes, in seconds.
    #[arg(short = 't', long, default_value_t = DEFAULT_SOFT_TIMEOUT_SECONDS)]
    pub timeout: u64,
    /// Print commands that would be run without this flag, and quit.
    #[arg(short = 'd', long)]
    pub dryrun: bool,
    /// List matching queues, and quit.
    #[arg(long = "list-queues")]
    pub list_queues: bool,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::Cli;

    #[test]
    fn defaults_match_sidekiq_recommendations() {
        let cli = Cli::try_parse_from(["sidekiq-cluster", "foo"]).expect("expected parse");
        assert_eq!(cli.queues, vec!["foo"]);
        assert_eq!(cli.max_concurrency, 50);
        assert_eq!(cli.min_concurrency, 0);
        assert_eq!(cli.interval, 5);
        assert_eq!(cli.timeout, 25);
        assert!(!cli.dryrun && !cli.list_queues && !cli.negate && !cli.queue_selector);
        assert_eq!(cli.environment, None);
    }

    #[test]
    fn short_and_long_flags_are_accepted() {
        let cli = Cli::try_parse_from([
            "sidekiq-cluster",
            "foo,bar,baz",
            "solo",
            "-m",
            "2",
            "--min-concurrency",
            "1",
            "-e",
            "production",
            "-P",
            "/tmp/cluster.pid",
            "-r",
            "/srv/gitlab",
            "-n",
            "-i",
            "1",
            "-t",
            "10",
            "-d",
        ])
        .expect("expected parse");

        assert_eq!(cli.queues, vec!["foo,bar,baz", "solo"]);
        assert_eq!(cli.max_concurrency, 2);
        assert_eq!(cli.min_concurrency, 1);
        assert_eq!(cli.environment.as_deref(), Some("production"));
        assert_eq!(cli.pidfile, Some(PathBuf::from("/tmp/cluster.pid")));
        assert_eq!(cli.rails_path, Some(PathBuf::from("/srv/gitlab")));
        assert!(cli.negate);
        assert_eq!(cli.interval, 1);
        assert_eq!(cli.timeout, 10);
        assert!(cli.dryrun);
    }

    #[test]
    fn queue_selector_is_a_switch() {
        let cli = Cli::try_parse_from([
            "sidekiq-cluster",
            "--queue-selector",
            "feature_category=chatops&has_external_dependencies=true",
        ])
        .expect("expected parse");
        assert!(cli.queue_selector);
        assert_eq!(
            cli.queues,
            vec!["feature_category=chatops&has_external_dependencies=true"]
        );
    }

    #[test]
    fn negative_concurrency_is_rejected() {
        assert!(Cli::try_parse_from(["sidekiq-cluster", "foo", "-m", "-1"]).is_err());
    }
}
