use async_trait::async_trait;

use super::Command;
use crate::os::sys::Sys;

pub struct Echo;

#[async_trait]
impl Command for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn where_path(&self) -> &'static str {
        "/bin/echo"
    }

    async fn exec(&self, args: &[String], sys: &mut Sys) -> i32 {
        let line = format!("{}\n", args.join(" "));
        let _ = sys.write_str(&line).await;
        0
    }
}
