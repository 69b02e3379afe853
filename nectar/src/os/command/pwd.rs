use async_trait::async_trait;

use super::Command;
use crate::os::sys::Sys;

pub struct Pwd;

#[async_trait]
impl Command for Pwd {
    fn name(&self) -> &'static str {
        "pwd"
    }

    fn where_path(&self) -> &'static str {
        "/bin/pwd"
    }

    async fn exec(&self, _args: &[String], sys: &mut Sys) -> i32 {
        let cwd = sys.getcwd().to_string();
        let _ = sys.write_str(&format!("{cwd}\n")).await;
        0
    }
}
