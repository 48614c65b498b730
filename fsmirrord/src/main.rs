use fsmirrord::daemon::{MirrorCommand, MirrorConfig, MirrorRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run(MirrorCommand),
    Help,
}

const USAGE: &str = "\
Usage: fsmirrord <command>
  roots        List the peer's file-system roots
  ls PATH      List a directory
  stat PATH    Show fresh attributes of an entry
  check PATH   Compare a cached file with the remote one
  fetch PATH   Download a file into the cache
  watch PATH   Keep a subtree current until interrupted";

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Help);
    };
    let mut path = |name: &str| {
        args.next()
            .ok_or_else(|| anyhow::anyhow!("{name} needs a PATH argument"))
    };
    let mode = match command.as_str() {
        "--help" | "-h" | "help" => CliMode::Help,
        "roots" => CliMode::Run(MirrorCommand::Roots),
        "ls" => CliMode::Run(MirrorCommand::List(path("ls")?)),
        "stat" => CliMode::Run(MirrorCommand::Stat(path("stat")?)),
        "check" => CliMode::Run(MirrorCommand::Check(path("check")?)),
        "fetch" => CliMode::Run(MirrorCommand::Fetch(path("fetch")?)),
        "watch" => CliMode::Run(MirrorCommand::Watch(path("watch")?)),
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FSMIRROR_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let command = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        CliMode::Run(command) => command,
    };
    let config = MirrorConfig::from_env()?;
    let runtime = MirrorRuntime::bootstrap(config).await?;
    runtime.run(command).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("fsmirrord")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_help() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Help);
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_reads_commands_with_paths() {
        assert_eq!(
            parse_cli_mode(args(&["roots"])).unwrap(),
            CliMode::Run(MirrorCommand::Roots)
        );
        assert_eq!(
            parse_cli_mode(args(&["ls", "/etc"])).unwrap(),
            CliMode::Run(MirrorCommand::List("/etc".into()))
        );
        assert_eq!(
            parse_cli_mode(args(&["fetch", "C:\\Users\\a.txt"])).unwrap(),
            CliMode::Run(MirrorCommand::Fetch("C:\\Users\\a.txt".into()))
        );
    }

    #[test]
    fn parse_cli_mode_rejects_missing_and_extra_arguments() {
        assert!(parse_cli_mode(args(&["stat"])).is_err());
        assert!(parse_cli_mode(args(&["check", "/a", "/b"])).is_err());
        assert!(parse_cli_mode(args(&["--logout"])).is_err());
    }
}
