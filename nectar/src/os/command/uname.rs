use async_trait::async_trait;

use super::Command;
use crate::os::sys::Sys;

const KERNEL_NAME: &str = "Linux";
const KERNEL_RELEASE: &str = "4.4.0-43-generic";
const KERNEL_VERSION: &str = "#129-Ubuntu SMP Thu Mar 17 20:17:14 UTC 2017";
const MACHINE: &str = "x86_64";
const OPERATING_SYSTEM: &str = "GNU/Linux";

const USAGE: &str = "Usage: uname [OPTION]...
Print certain system information.  With no OPTION, same as -s.

  -a, --all                print all information, in the following order,
                             except omit -p and -i if unknown:
  -s, --kernel-name        print the kernel name
  -n, --nodename           print the network node hostname
  -r, --kernel-release     print the kernel release
  -v, --kernel-version     print the kernel version
  -m, --machine            print the machine hardware name
  -p, --processor          print the processor type (non-portable)
  -i, --hardware-platform  print the hardware platform (non-portable)
  -o, --operating-system   print the operating system
      --help     display this help and exit
      --version  output version information and exit
";

pub struct Uname;

#[derive(Default)]
struct Fields {
    kernel: bool,
    node: bool,
    release: bool,
    version: bool,
    machine: bool,
    processor: bool,
    platform: bool,
    os: bool,
}

impl Fields {
    fn all() -> Self {
        Fields {
            kernel: true,
            node: true,
            release: true,
            version: true,
            machine: true,
            processor: true,
            platform: true,
            os: true,
        }
    }

    fn any(&self) -> bool {
        self.kernel
            || self.node
            || self.release
            || self.version
            || self.machine
            || self.processor
            || self.platform
            || self.os
    }
}

enum Parsed {
    Fields(Fields),
    Help,
    Version,
    Invalid(char),
}

fn parse(args: &[String]) -> Parsed {
    let mut fields = Fields::default();
    for arg in args {
        match arg.as_str() {
            "--help" => return Parsed::Help,
            "--version" => return Parsed::Version,
            "--all" => fields = Fields::all(),
            "--kernel-name" => fields.kernel = true,
            "--nodename" => fields.node = true,
            "--kernel-release" => fields.release = true,
            "--kernel-version" => fields.version = true,
            "--machine" => fields.machine = true,
            "--processor" => fields.processor = true,
            "--hardware-platform" => fields.platform = true,
            "--operating-system" => fields.os = true,
            flag if flag.starts_with('-') && flag.len() > 1 => {
                for ch in flag[1..].chars() {
                    match ch {
                        'a' => fields = Fields::all(),
                        's' => fields.kernel = true,
                        'n' => fields.node = true,
                        'r' => fields.release = true,
                        'v' => fields.version = true,
                        'm' => fields.machine = true,
                        'p' => fields.processor = true,
                        'i' => fields.platform = true,
                        'o' => fields.os = true,
                        other => return Parsed::Invalid(other),
                    }
                }
            }
            _ => {}
        }
    }
    Parsed::Fields(fields)
}

#[async_trait]
impl Command for Uname {
    fn name(&self) -> &'static str {
        "uname"
    }

    fn where_path(&self) -> &'static str {
        "/bin/uname"
    }

    fn help(&self) -> &'static str {
        USAGE
    }

    async fn exec(&self, args: &[String], sys: &mut Sys) -> i32 {
        let mut fields = match parse(args) {
            Parsed::Help => {
                let _ = sys.write_str(USAGE).await;
                return 0;
            }
            Parsed::Version => {
                let _ = sys.write_str("uname (GNU coreutils) 8.25\n").await;
                return 0;
            }
            Parsed::Invalid(ch) => {
                let _ = sys
                    .write_str(&format!(
                        "uname: invalid option -- '{ch}'\nTry 'uname --help' for more information.\n"
                    ))
                    .await;
                return 1;
            }
            Parsed::Fields(f) => f,
        };
        if !fields.any() {
            fields.kernel = true;
        }

        let mut parts: Vec<&str> = Vec::new();
        if fields.kernel {
            parts.push(KERNEL_NAME);
        }
        if fields.node {
            parts.push(&sys.hostname);
        }
        if fields.release {
            parts.push(KERNEL_RELEASE);
        }
        if fields.version {
            parts.push(KERNEL_VERSION);
        }
        if fields.machine {
            parts.push(MACHINE);
        }
        if fields.processor {
            parts.push(MACHINE);
        }
        if fields.platform {
            parts.push(MACHINE);
        }
        if fields.os {
            parts.push(OPERATING_SYSTEM);
        }
        let line = format!("{}\n", parts.join(" "));
        let _ = sys.write_str(&line).await;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sys::test_support::{read_output, sys_fixture};

    #[tokio::test]
    async fn test_uname_plain() {
        let mut fx = sys_fixture();
        assert_eq!(Uname.exec(&[], &mut fx.sys).await, 0);
        assert_eq!(read_output(&mut fx.out).await, "Linux\r\n");
    }

    #[tokio::test]
    async fn test_uname_all() {
        let mut fx = sys_fixture();
        assert_eq!(Uname.exec(&["-a".to_string()], &mut fx.sys).await, 0);
        let out = read_output(&mut fx.out).await;
        assert_eq!(
            out,
            "Linux spr1139 4.4.0-43-generic #129-Ubuntu SMP Thu Mar 17 20:17:14 UTC 2017 \
             x86_64 x86_64 x86_64 GNU/Linux\r\n"
        );
    }

    #[tokio::test]
    async fn test_uname_combined_flags() {
        let mut fx = sys_fixture();
        assert_eq!(Uname.exec(&["-sn".to_string()], &mut fx.sys).await, 0);
        assert_eq!(read_output(&mut fx.out).await, "Linux spr1139\r\n");
    }

    #[tokio::test]
    async fn test_uname_invalid_flag() {
        let mut fx = sys_fixture();
        assert_eq!(Uname.exec(&["-z".to_string()], &mut fx.sys).await, 1);
        let out = read_output(&mut fx.out).await;
        assert!(out.starts_with("uname: invalid option -- 'z'"));
    }
}
