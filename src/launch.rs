use std::path::PathBuf;

use crate::viewport::MAX_VIEWPORTS;

/// Files to open at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub paths: Vec<PathBuf>,
    /// Zero-based slot that receives the first series once loading finishes.
    pub show_in: Option<usize>,
}

pub fn parse_launch_request_from_args(args: &[String]) -> Result<Option<LaunchRequest>, String> {
    let mut paths = Vec::new();
    let mut show_in = None;
    let mut saw_open = false;
    let mut only_paths = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if only_paths {
            paths.push(PathBuf::from(arg));
            continue;
        }
        match arg.as_str() {
            "--" => only_paths = true,
            "--open" => saw_open = true,
            "--viewport" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "Missing viewport number after --viewport.".to_string())?;
                show_in = Some(parse_viewport_number(value)?);
            }
            flag if flag.starts_with("--") => return Err(format!("Unknown option {flag}.")),
            path => paths.push(PathBuf::from(path)),
        }
    }

    if paths.is_empty() {
        if saw_open {
            return Err("Missing file path(s) after --open.".to_string());
        }
        if show_in.is_some() {
            return Err("--viewport needs file path(s) to open.".to_string());
        }
        return Ok(None);
    }
    Ok(Some(LaunchRequest { paths, show_in }))
}

fn parse_viewport_number(value: &str) -> Result<usize, String> {
    match value.trim().parse::<usize>() {
        Ok(number) if (1..=MAX_VIEWPORTS).contains(&number) => Ok(number - 1),
        _ => Err(format!(
            "Viewport must be a number from 1 to {MAX_VIEWPORTS}, got {value}."
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn no_arguments_means_no_request() {
        assert_eq!(parse_launch_request_from_args(&[]), Ok(None));
    }

    #[test]
    fn raw_paths_and_open_flag_are_equivalent() {
        let expected = Some(LaunchRequest {
            paths: vec![PathBuf::from("/data/ct"), PathBuf::from("a.dcm")],
            show_in: None,
        });
        assert_eq!(
            parse_launch_request_from_args(&args(&["/data/ct", "a.dcm"])),
            Ok(expected.clone())
        );
        assert_eq!(
            parse_launch_request_from_args(&args(&["--open", "/data/ct", "a.dcm"])),
            Ok(expected)
        );
    }

    #[test]
    fn open_requires_paths() {
        assert!(parse_launch_request_from_args(&args(&["--open"])).is_err());
    }

    #[test]
    fn viewport_is_one_based_on_the_command_line() {
        let request = parse_launch_request_from_args(&args(&["--viewport", "3", "ct"]))
            .expect("valid")
            .expect("request");
        assert_eq!(request.show_in, Some(2));

        assert!(parse_launch_request_from_args(&args(&["--viewport", "0", "ct"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--viewport", "5", "ct"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["ct", "--viewport"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--viewport", "2"])).is_err());
    }

    #[test]
    fn double_dash_allows_dash_prefixed_paths() {
        let request = parse_launch_request_from_args(&args(&["--", "--weird.dcm"]))
            .expect("valid")
            .expect("request");
        assert_eq!(request.paths, vec![PathBuf::from("--weird.dcm")]);
        assert!(parse_launch_request_from_args(&args(&["--weird.dcm"])).is_err());
    }
}
