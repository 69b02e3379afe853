use async_trait::async_trait;

use super::Command;
use crate::os::sys::Sys;

pub struct Id;

#[async_trait]
impl Command for Id {
    fn name(&self) -> &'static str {
        "id"
    }

    fn where_path(&self) -> &'static str {
        "/usr/bin/id"
    }

    async fn exec(&self, _args: &[String], sys: &mut Sys) -> i32 {
        let uid = sys.current_uid();
        let gid = sys.current_gid();
        let user = sys.accounts.user_name(uid);
        let group = sys.accounts.group_name(gid);
        let _ = sys
            .write_str(&format!(
                "uid={uid}({user}) gid={gid}({group}) groups={gid}({group})\n"
            ))
            .await;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sys::test_support::{read_output, sys_fixture};

    #[tokio::test]
    async fn test_id_renders_session_identity() {
        let mut fx = sys_fixture();
        let code = Id.exec(&[], &mut fx.sys).await;
        assert_eq!(code, 0);
        assert_eq!(
            read_output(&mut fx.out).await,
            "uid=1001(bob) gid=1001(bob) groups=1001(bob)\r\n"
        );
    }
}
