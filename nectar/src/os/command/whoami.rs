use async_trait::async_trait;

use super::Command;
use crate::os::sys::Sys;

pub struct Whoami;

#[async_trait]
impl Command for Whoami {
    fn name(&self) -> &'static str {
        "whoami"
    }

    fn where_path(&self) -> &'static str {
        "/usr/bin/whoami"
    }

    async fn exec(&self, _args: &[String], sys: &mut Sys) -> i32 {
        let name = sys.user.name.clone();
        let _ = sys.write_str(&format!("{name}\n")).await;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sys::test_support::{read_output, sys_fixture};

    #[tokio::test]
    async fn test_whoami() {
        let mut fx = sys_fixture();
        let code = Whoami.exec(&[], &mut fx.sys).await;
        assert_eq!(code, 0);
        assert_eq!(read_output(&mut fx.out).await, "bob\r\n");
    }
}
