use crate::config::ArchiverConfig;
use crate::job::CloneOptions;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "website-archiver",
    about = "Clone a web page with all of its resources into a ZIP archive",
    version,
    long_about = "Downloads a page together with its images, stylesheets, scripts, fonts and media, rewrites every reference to point at the local copies and packages the result as a self-contained ZIP archive."
)]
pub struct ArchiverCommand {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Where archives are stored (overrides the config file)
    #[arg(long, global = true)]
    pub storage_dir: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Clone a page into an archive
    Clone(CloneArgs),

    /// Remove archives older than the retention period
    Sweep,
}

#[derive(Args, Debug)]
pub struct CloneArgs {
    /// The URL of the page to clone
    #[arg(required = true)]
    pub url: String,

    /// Keep every file exactly as downloaded (no image or code optimization)
    #[arg(long)]
    pub simple_download: bool,

    /// Request the page as a mobile browser
    #[arg(long)]
    pub mobile_version: bool,

    /// Also clone linked pages of the same site
    #[arg(long)]
    pub save_structure: bool,

    /// Accepted for compatibility; file names always mirror the site
    #[arg(long)]
    pub rename_assets: bool,

    /// Maximum concurrent downloads
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u64).range(1..))]
    pub concurrency: Option<u64>,

    /// Skip the headless browser and parse the raw HTML only
    #[arg(long)]
    pub no_render: bool,

    /// Leave resources from other hosts online
    #[arg(long)]
    pub no_externals: bool,
}

impl ArchiverCommand {
    /// `tracing` filter directive for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "website_archiver=info,warn",
            (false, 1) => "website_archiver=debug,info",
            (false, _) => "trace",
        }
    }

    /// Applies command-line overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut ArchiverConfig) {
        if let Some(dir) = &self.storage_dir {
            config.storage.storage_dir = dir.clone();
        }

        if let Command::Clone(args) = &self.command {
            if let Some(concurrency) = args.concurrency {
                config.cloning.concurrency = concurrency as usize;
            }
            if args.no_render {
                config.cloning.render = false;
            }
            if args.no_externals {
                config.cloning.include_externals = false;
            }
        }
    }
}

impl CloneArgs {
    pub fn options(&self) -> CloneOptions {
        CloneOptions {
            rename_assets: self.rename_assets,
            simple_download: self.simple_download,
            mobile_version: self.mobile_version,
            save_structure: self.save_structure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clone_args(cmd: &ArchiverCommand) -> &CloneArgs {
        match &cmd.command {
            Command::Clone(args) => args,
            other => panic!("expected clone, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_basic_args() {
        let cmd = ArchiverCommand::try_parse_from(["website-archiver", "clone", "https://example.com"]).unwrap();
        let args = clone_args(&cmd);

        assert_eq!(args.url, "https://example.com");
        assert_eq!(args.options(), CloneOptions::default());
        assert_eq!(args.concurrency, None);
        assert!(!args.no_render);
        assert_eq!(cmd.verbose, 0);
        assert!(!cmd.quiet);
    }

    #[test]
    fn test_parse_all_args() {
        let cmd = ArchiverCommand::try_parse_from([
            "website-archiver",
            "clone",
            "https://example.com",
            "--simple-download",
            "--mobile-version",
            "--save-structure",
            "--rename-assets",
            "-c", "8",
            "--no-render",
            "--no-externals",
            "--storage-dir", "/srv/archives",
            "-vv",
        ])
        .unwrap();

        let options = clone_args(&cmd).options();
        assert!(options.simple_download && options.mobile_version);
        assert!(options.save_structure && options.rename_assets);
        assert_eq!(cmd.verbose, 2);

        let mut config = ArchiverConfig::default();
        cmd.apply_overrides(&mut config);
        assert_eq!(config.cloning.concurrency, 8);
        assert!(!config.cloning.render);
        assert!(!config.cloning.include_externals);
        assert_eq!(config.storage.storage_dir, PathBuf::from("/srv/archives"));
    }

    #[test]
    fn test_parse_sweep() {
        let cmd = ArchiverCommand::try_parse_from(["website-archiver", "sweep", "--config", "archiver.toml"]).unwrap();
        assert!(matches!(cmd.command, Command::Sweep));
        assert_eq!(cmd.config, Some(PathBuf::from("archiver.toml")));
    }

    #[test]
    fn test_parse_missing_url() {
        assert!(ArchiverCommand::try_parse_from(["website-archiver", "clone"]).is_err());
    }

    #[test]
    fn test_parse_invalid_concurrency() {
        let result = ArchiverCommand::try_parse_from(["website-archiver", "clone", "https://example.com", "-c", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        let result = ArchiverCommand::try_parse_from(["website-archiver", "-v", "-q", "sweep"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_filter() {
        let quiet = ArchiverCommand::try_parse_from(["website-archiver", "-q", "sweep"]).unwrap();
        assert_eq!(quiet.log_filter(), "error");
        let normal = ArchiverCommand::try_parse_from(["website-archiver", "sweep"]).unwrap();
        assert_eq!(normal.log_filter(), "website_archiver=info,warn");
    }
}
