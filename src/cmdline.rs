// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::collections::HashMap;

use anyhow::{bail, Result};

enum ArgsType {
    Flag,
    Opt,
}

struct Arg {
    args_type: ArgsType,
    value: Option<String>,
    // Whether this parameter was configured.
    presented: bool,
}

impl Arg {
    fn new(args_type: ArgsType) -> Self {
        Self {
            args_type,
            value: None,
            presented: false,
        }
    }
}

pub struct ArgsParse {
    args: HashMap<String, Arg>,
    pub free: Vec<String>,
}

impl ArgsParse {
    pub fn create(opt_flag: Vec<&str>, opt_value: Vec<&str>) -> Self {
        let mut args: HashMap<String, Arg> = HashMap::new();
        for arg_name in opt_flag {
            args.insert(arg_name.to_string(), Arg::new(ArgsType::Flag));
        }
        for arg_name in opt_value {
            args.insert(arg_name.to_string(), Arg::new(ArgsType::Opt));
        }

        Self {
            args,
            free: Vec::new(),
        }
    }

    pub fn parse(&mut self, args: Vec<String>) -> Result<()> {
        let mut pending: Option<String> = None;

        for word in args {
            if let Some(name) = pending.take() {
                let arg = self.args.get_mut(&name).unwrap();
                arg.value = Some(word);
                arg.presented = true;
                continue;
            }
            if word.starts_with('-') && word.len() > 1 {
                let name = if let Some(stripped) = word.strip_prefix("--") {
                    stripped.to_string()
                } else {
                    word[1..].to_string()
                };
                match self.args.get_mut(&name) {
                    Some(arg) => match arg.args_type {
                        ArgsType::Flag => arg.presented = true,
                        ArgsType::Opt => pending = Some(name),
                    },
                    None => bail!("unrecognized option '{}'", word),
                }
                continue;
            }
            self.free.push(word);
        }
        if let Some(name) = pending {
            bail!("missing argument for option '{}'", name);
        }
        Ok(())
    }

    pub fn is_present(&self, arg_name: &str) -> bool {
        self.args.get(arg_name).map_or(false, |arg| arg.presented)
    }

    pub fn value_of(&self, arg_name: &str) -> Option<String> {
        self.args.get(arg_name).and_then(|arg| arg.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags_values_and_free() {
        let mut parser = ArgsParse::create(vec!["verbose"], vec!["config", "logfile"]);
        parser
            .parse(
                vec!["--config", "hal.json", "-verbose", "cam0", "3"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            )
            .unwrap();
        assert_eq!(parser.value_of("config").as_deref(), Some("hal.json"));
        assert!(parser.is_present("verbose"));
        assert!(!parser.is_present("logfile"));
        assert_eq!(parser.free, vec!["cam0".to_string(), "3".to_string()]);
    }

    #[test]
    fn test_parse_errors() {
        let mut parser = ArgsParse::create(vec![], vec!["config"]);
        assert!(parser
            .parse(vec!["--config".to_string()])
            .is_err());

        let mut parser = ArgsParse::create(vec![], vec![]);
        assert!(parser.parse(vec!["--bogus".to_string()]).is_err());
    }
}
