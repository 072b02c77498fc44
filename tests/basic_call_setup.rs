//! End-to-end: UAC sends INVITE, UAS auto-accepts, dialog reaches
//! `Established` on both sides, then UAC hangs up and both sides clean up.

mod support;

use std::sync::Arc;
use std::time::Duration;

use rsip::Uri;
use sip_dialog_core::{ApiResult, DialogState, InviteOpts, ResponseOpts, Stack, StackConfig};
use support::loopback_transport::pair;
use tokio::time::timeout;

async fn wait_for_state(dialog: &Arc<sip_dialog_core::Dialog>, target: DialogState) {
    timeout(Duration::from_secs(2), async {
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

fn config(host: &str, port: u16) -> StackConfig {
    StackConfig::builder().local_host_port(host, port).build().unwrap()
}

#[tokio::test]
async fn call_setup_and_teardown() -> ApiResult<()> {
    let alice_addr = "127.0.0.1:5060".parse().unwrap();
    let bob_addr = "127.0.0.1:5061".parse().unwrap();
    let (alice_transport, bob_transport) = pair(alice_addr, bob_addr);

    let alice_stack = Stack::new(Arc::new(alice_transport), config("127.0.0.1", 5060), None);
    let bob_stack = Stack::new(Arc::new(bob_transport), config("127.0.0.1", 5061), None);

    bob_stack.on_incoming_invite(|dialog, _request| {
        tokio::spawn(async move {
            dialog.accept(ResponseOpts::default()).await.expect("accept failed");
        });
    });

    {
        let alice_stack = alice_stack.clone();
        tokio::spawn(async move { alice_stack.run().await });
    }
    {
        let bob_stack = bob_stack.clone();
        tokio::spawn(async move { bob_stack.run().await });
    }

    let alice_uri = Uri::try_from("sip:alice@127.0.0.1:5060").unwrap();
    let bob_uri = Uri::try_from("sip:bob@127.0.0.1:5061").unwrap();

    let alice_dialog = alice_stack.new_invite(alice_uri, bob_uri, InviteOpts::default()).await?;
    wait_for_state(&alice_dialog, DialogState::Established).await;

    assert_eq!(alice_stack.dialog_count(), 1);
    timeout(Duration::from_secs(1), async {
        while bob_stack.dialog_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bob never saw the dialog");

    alice_stack.bye(&alice_dialog).await?;
    wait_for_state(&alice_dialog, DialogState::Terminated).await;

    timeout(Duration::from_secs(1), async {
        while alice_stack.dialog_count() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("alice's registry never cleaned up the terminated dialog");

    Ok(())
}
