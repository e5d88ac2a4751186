use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use parley::{
    GroupClient, Participant, SignalEvent, SimulatedFabric, SimulatedTransport,
};

#[tokio::main]
async fn main() -> Result<(), parley::SignalError> {
    tracing_subscriber::fmt::init();

    println!("   Parley loopback demo");
    println!("   Two simulated clients negotiate over one fabric\n");

    let fabric = SimulatedFabric::new();
    let ada = GroupClient::new(SimulatedTransport::new(&fabric, "peer_ada"), "peer_ada");
    let bob = GroupClient::new(SimulatedTransport::new(&fabric, "peer_bob"), "peer_bob");

    for (label, client) in [("ada", &ada), ("bob", &bob)] {
        let label = label.to_string();
        client.add_listener(Arc::new(move |event: SignalEvent| match event {
            SignalEvent::ParticipantJoined { id, participant } => {
                println!("[{label}] participant joined: {id} ({:?})", participant.name);
            }
            SignalEvent::Message(msg) => {
                println!("[{label}] {:?} from {:?}", msg.kind, msg.from);
            }
            SignalEvent::GroupMessage { from, payload } => {
                println!("[{label}] group message from {from}: {payload}");
            }
            _ => {}
        }));
    }

    ada.connect().await?;
    bob.connect().await?;

    ada.join_group("demo", Participant::named("Ada"));
    bob.join_group("demo", Participant::named("Bob"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    ada.send_group_offer(json!({"sdp": "v=0 (offer)"}), "peer_bob");
    bob.send_group_answer(json!({"sdp": "v=0 (answer)"}), "peer_ada");
    bob.send_group_message(json!({"text": "hello from bob"}));
    tokio::time::sleep(Duration::from_millis(100)).await;

    ada.disconnect().await;
    bob.disconnect().await;
    println!("\n   Done.");
    Ok(())
}
