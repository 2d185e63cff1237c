use std::time::Duration;
use tokio::time::timeout;
use wireloom::socket::memory::socket_pair;
use wireloom::{CallError, Router};

/// Scenario: a send-channel with capacity 1. Two sends in rapid
/// succession, without awaiting the first reply, must reject the second
/// because the send buffer is full.
#[tokio::test]
async fn rapid_second_send_is_rejected() {
    let (client_socket, server_socket) = socket_pair(64);

    let mut server_router = Router::new();
    let server_route = server_router.route_at(5).unwrap();
    server_router
        .recv_channel(&server_route, 1, |req: u32| async move { req + 1 })
        .unwrap();
    let _server = server_router.start(server_socket).unwrap();

    let mut client_router = Router::new();
    let client_route = client_router.route_at(5).unwrap();
    let caller = client_router.send_channel::<u32, u32>(&client_route, 1).unwrap();
    let _client = client_router.start(client_socket).unwrap();

    let session = caller.open().unwrap();

    // Back-to-back sends with no await between them: the single-slot
    // buffer still holds the first message.
    session.send(1).unwrap();
    match session.send(2) {
        Err(e @ CallError::SendFailed) => assert_eq!(e.to_string(), "Failed to send"),
        other => panic!("second send must be rejected, got {other:?}"),
    }

    // The first message still round-trips.
    let reply = timeout(Duration::from_secs(2), session.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, 2);

    // With the buffer drained, sending works again.
    session.send(10).unwrap();
    let reply = timeout(Duration::from_secs(2), session.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, 11);

    session.close();
}
