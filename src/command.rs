use std::str::FromStr;

/// Operator commands read from stdin
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    ClearModule,
    ClearDatabase,
    /// Follow another module; the database log is cleared unless `keep`
    Switch { module: String, keep: bool },
    Refresh,
    Sizes,
    Verify,
    Start,
    Stop,
    Help,
    Quit,
}

pub const HELP: &str = "commands: clear module | clear db | switch <module> [--keep] | \
                        refresh | sizes | verify | start | stop | help | quit";

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            ["clear", "module"] => Self::ClearModule,
            ["clear", "db" | "database"] => Self::ClearDatabase,
            ["switch", module] => Self::Switch {
                module: module.to_string(),
                keep: false,
            },
            ["switch", module, "--keep"] | ["switch", "--keep", module] => Self::Switch {
                module: module.to_string(),
                keep: true,
            },
            ["refresh"] => Self::Refresh,
            ["sizes"] => Self::Sizes,
            ["verify"] => Self::Verify,
            ["start"] => Self::Start,
            ["stop"] => Self::Stop,
            ["help" | "?"] => Self::Help,
            ["quit" | "exit" | "q"] => Self::Quit,
            _ => return Err(format!("unknown command: {}", line.trim())),
        };
        Ok(command)
    }
}
