// 接收机命令文本解析
//
// 命令文本按行拆分。"!WAIT <ms>" 行表示发送间隔，其余非空行原样发送。
// 周期命令的行尾可带 "# <周期毫秒>"，缺省周期为 1000 ms。

/// 单条 !WAIT 的最长等待
pub const MAX_WAIT_MS: u64 = 3000;

/// 周期命令的缺省周期
pub const DEFAULT_PERIOD_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    Wait(u64),
    Send(String),
}

/// 拆分命令文本
pub fn parse_command(text: &str) -> Vec<CommandLine> {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.strip_prefix("!WAIT") {
            Some(rest) => {
                let ms = rest.trim().parse::<u64>().unwrap_or(0);
                CommandLine::Wait(ms.min(MAX_WAIT_MS))
            }
            None => CommandLine::Send(line.to_string()),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicCommand {
    pub text: String,
    pub period_ms: u64,
}

/// 解析周期命令，去掉行尾的周期注释及其前面的空格
pub fn parse_periodic(text: &str) -> Vec<PeriodicCommand> {
    text.split(['\r', '\n'])
        .filter_map(|line| {
            let (body, period) = match line.rfind('#') {
                Some(pos) => {
                    let period = line[pos + 1..].trim().parse::<u64>().unwrap_or(0);
                    (&line[..pos], period)
                }
                None => (line, 0),
            };
            let body = body.trim_end();
            if body.trim().is_empty() {
                return None;
            }
            Some(PeriodicCommand {
                text: body.to_string(),
                period_ms: if period == 0 { DEFAULT_PERIOD_MS } else { period },
            })
        })
        .collect()
}

/// 按累计运行毫秒数挑出本周期需要发送的命令
pub fn due_commands(commands: &[PeriodicCommand], elapsed_ms: u64) -> Vec<&PeriodicCommand> {
    commands
        .iter()
        .filter(|cmd| elapsed_ms % cmd.period_ms == 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_with_wait() {
        let lines = parse_command("UNLOGALL\r\n!WAIT 500\n\nLOG RANGEB ONTIME 1\n!WAIT 99999");
        assert_eq!(
            lines,
            vec![
                CommandLine::Send("UNLOGALL".into()),
                CommandLine::Wait(500),
                CommandLine::Send("LOG RANGEB ONTIME 1".into()),
                CommandLine::Wait(MAX_WAIT_MS),
            ]
        );
    }

    #[test]
    fn test_parse_periodic_suffix() {
        let cmds = parse_periodic("LOG BESTPOS   # 5000\nLOG TIME\n   # 200\n");
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].text, "LOG BESTPOS");
        assert_eq!(cmds[0].period_ms, 5000);
        assert_eq!(cmds[1].text, "LOG TIME");
        assert_eq!(cmds[1].period_ms, DEFAULT_PERIOD_MS);
    }

    #[test]
    fn test_due_commands() {
        let cmds = parse_periodic("A # 500\nB # 2000");
        let names = |ms| {
            due_commands(&cmds, ms)
                .iter()
                .map(|c| c.text.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(0), vec!["A", "B"]);
        assert_eq!(names(500), vec!["A"]);
        assert!(names(700).is_empty());
        assert_eq!(names(2000), vec!["A", "B"]);
    }
}
