use std::fmt;

/// Logical key of a judge problem, derived from its public URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProblemRef {
    pub platform: String,
    pub problem_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProblemUrlError {
    #[error("not an http(s) URL: {0}")]
    NotHttp(String),
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("unrecognized problem path for {platform}: {path}")]
    UnrecognizedPath { platform: String, path: String },
}

impl ProblemRef {
    pub fn new(platform: impl Into<String>, problem_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            problem_id: problem_id.into(),
        }
    }

    /// Supported shapes:
    /// - codeforces.com/problemset/problem/{contest}/{index}
    /// - codeforces.com/{contest|gym}/{contest}/problem/{index}
    /// - atcoder.jp/contests/{contest}/tasks/{task}
    /// - acmicpc.net/problem/{number}
    pub fn from_url(url: &str) -> Result<Self, ProblemUrlError> {
        let trimmed = url.trim();
        let rest = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .ok_or_else(|| ProblemUrlError::NotHttp(trimmed.to_string()))?;

        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        let host = host.to_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        let path = path.split(['?', '#']).next().unwrap_or("");
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let unrecognized = |platform: &str| ProblemUrlError::UnrecognizedPath {
            platform: platform.to_string(),
            path: format!("/{}", path),
        };

        match host {
            "codeforces.com" | "m1.codeforces.com" | "m2.codeforces.com" | "m3.codeforces.com" => {
                match segments.as_slice() {
                    ["problemset", "problem", contest, index]
                    | ["contest", contest, "problem", index]
                    | ["gym", contest, "problem", index]
                        if is_number(contest) && is_word(index) =>
                    {
                        Ok(Self::new(
                            "codeforces",
                            format!("{}{}", contest, index.to_uppercase()),
                        ))
                    }
                    _ => Err(unrecognized("codeforces")),
                }
            }
            "atcoder.jp" => match segments.as_slice() {
                ["contests", _contest, "tasks", task] if is_word(task) => {
                    Ok(Self::new("atcoder", task.to_lowercase()))
                }
                _ => Err(unrecognized("atcoder")),
            },
            "acmicpc.net" => match segments.as_slice() {
                ["problem", number] if is_number(number) => Ok(Self::new("baekjoon", *number)),
                _ => Err(unrecognized("baekjoon")),
            },
            other => Err(ProblemUrlError::UnsupportedPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for ProblemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.platform, self.problem_id)
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
