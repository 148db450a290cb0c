//! Command-line arguments and config path helpers.

use std::path::PathBuf;

use clap::Parser;

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false)
}

#[derive(Parser, Debug)]
#[command(version, about = "Capture record streams into time-bucketed files and ship them")]
pub struct CliArgs {
    /// Path to the pipeline configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override the node identity recorded as owner of every file
    #[arg(long)]
    pub owner: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_is_yaml_file() {
        assert!(is_yaml_file(Path::new("a.yaml")));
        assert!(is_yaml_file(Path::new("dir/b.yml")));
        assert!(!is_yaml_file(Path::new("c.json")));
        assert!(!is_yaml_file(Path::new("noext")));
    }

    #[test]
    fn test_cli_args_parse() {
        let args = CliArgs::parse_from(["spillway", "-c", "p.yaml", "--owner", "node://a"]);
        assert_eq!(args.config, PathBuf::from("p.yaml"));
        assert_eq!(args.owner.as_deref(), Some("node://a"));
    }
}
