use async_trait::async_trait;
use rand::Rng;

use super::Command;
use crate::os::sys::Sys;

pub struct Uptime;

#[async_trait]
impl Command for Uptime {
    fn name(&self) -> &'static str {
        "uptime"
    }

    fn where_path(&self) -> &'static str {
        "/usr/bin/uptime"
    }

    async fn exec(&self, _args: &[String], sys: &mut Sys) -> i32 {
        let now = chrono::Local::now().format("%I:%M:%S");
        let (l5, l10, l15) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(0.0f64..1.0) + 9.0,
                rng.gen_range(0.0f64..1.0) + 9.0,
                rng.gen_range(0.0f64..1.0) + 9.0,
            )
        };
        let _ = sys
            .write_str(&format!(
                "{now} up 3 days,  3 users,  load average: {l5:.2}, {l10:.2}, {l15:.2}\n"
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
    async fn test_uptime_shape() {
        let mut fx = sys_fixture();
        assert_eq!(Uptime.exec(&[], &mut fx.sys).await, 0);
        let out = read_output(&mut fx.out).await;
        assert!(out.contains("up 3 days,  3 users,  load average: "));
        // loads are synthesized in [9, 10)
        let loads: Vec<f64> = out
            .trim_end()
            .rsplit("load average: ")
            .next()
            .unwrap()
            .split(", ")
            .map(|v| v.parse().unwrap())
            .collect();
        assert_eq!(loads.len(), 3);
        for load in loads {
            assert!((9.0..10.0).contains(&load));
        }
    }
}
