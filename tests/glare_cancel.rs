//! UAC sends INVITE, then CANCELs it before the UAS ever answers. Both
//! sides should reach `Terminated` without either side ever seeing
//! `Established`.

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
async fn cancel_before_answer_terminates_both_sides() -> ApiResult<()> {
    let alice_addr = "127.0.0.1:5070".parse().unwrap();
    let bob_addr = "127.0.0.1:5071".parse().unwrap();
    let (alice_transport, bob_transport) = pair(alice_addr, bob_addr);

    let alice_stack = Stack::new(Arc::new(alice_transport), config("127.0.0.1", 5070), None);
    let bob_stack = Stack::new(Arc::new(bob_transport), config("127.0.0.1", 5071), None);

    // Bob takes his time deciding, long enough for Alice's CANCEL to land
    // first every run.
    bob_stack.on_incoming_invite(|dialog, _request| {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = dialog.accept(ResponseOpts::default()).await;
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

    let alice_uri = Uri::try_from("sip:alice@127.0.0.1:5070").unwrap();
    let bob_uri = Uri::try_from("sip:bob@127.0.0.1:5071").unwrap();

    let alice_dialog = alice_stack.new_invite(alice_uri, bob_uri, InviteOpts::default()).await?;

    timeout(Duration::from_secs(1), async {
        while bob_stack.dialog_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bob never saw the dialog");

    alice_dialog.cancel().await?;

    wait_for_state(&alice_dialog, DialogState::Terminated).await;

    timeout(Duration::from_secs(1), async {
        while bob_stack.dialog_count() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bob's registry never cleaned up the cancelled dialog");

    Ok(())
}
