//! An INVITE sent into the void (no peer ever answers) runs through Timer
//! A's retransmission schedule, then hits Timer B and terminates the
//! dialog with `TerminateReason::Timeout` — never `Rejected`, which is
//! reserved for an actual failure response.

mod support;

use std::sync::Arc;
use std::time::Duration;

use rsip::Uri;
use sip_dialog_core::{ApiResult, DialogState, InviteOpts, Stack, StackConfig, TerminateReason, TimerSettings};
use support::void_transport::VoidTransport;
use tokio::time::timeout;

async fn wait_for_state(dialog: &Arc<sip_dialog_core::Dialog>, target: DialogState) {
    timeout(Duration::from_secs(5), async {
        loop {
            if dialog.state().await == target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dialog never reached expected state");
}

#[tokio::test]
async fn unanswered_invite_times_out_and_is_reported_as_timeout() -> ApiResult<()> {
    let timers = TimerSettings { t1: Duration::from_millis(10), t2: Duration::from_millis(40), t4: Duration::from_millis(50) };
    let config = StackConfig::builder().local_host_port("127.0.0.1", 5079).timers(timers).build().unwrap();
    let stack = Stack::new(Arc::new(VoidTransport::new()), config, None);

    {
        let stack = stack.clone();
        tokio::spawn(async move { stack.run().await });
    }

    let local_uri = Uri::try_from("sip:alice@127.0.0.1:5079").unwrap();
    let remote_uri = Uri::try_from("sip:bob@127.0.0.1:5999").unwrap();

    let terminate_reason = Arc::new(std::sync::Mutex::new(None));

    let dialog = stack.new_invite(local_uri, remote_uri, InviteOpts::default()).await?;

    {
        let terminate_reason = terminate_reason.clone();
        dialog.on_terminate(move |event| {
            *terminate_reason.lock().unwrap() = Some(event.reason.clone());
        });
    }

    // Timer B fires at 64 * T1 = 640ms with these settings; give it a
    // generous margin over the `wait_for_state` timeout below.
    wait_for_state(&dialog, DialogState::Terminated).await;

    let reason = terminate_reason.lock().unwrap().clone().expect("terminate callback never fired");
    assert!(matches!(reason, TerminateReason::Timeout), "expected Timeout, got {reason:?}");

    Ok(())
}
