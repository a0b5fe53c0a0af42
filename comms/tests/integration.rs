use std::borrow::Cow;

use comms::msg::{Hello, Msg, MsgKind, Payload, Tensor};
use tokio::io;

#[tokio::test]
async fn send_recv_acts() {
    const SIZE: usize = 256;

    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let acts = Tensor::new(2, 3, &data[..]).unwrap();
    let msg = Msg::acts(MsgKind::C2fSendActs, 2, 1, acts, vec![2]).unwrap();

    tx.send(&msg).await.unwrap();

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut rx_buf: Vec<u32> = Vec::new();
    let received: Msg = rx.recv_into(&mut rx_buf).await.unwrap();

    assert_eq!(received.kind(), MsgKind::C2fSendActs);
    assert_eq!((received.sender(), received.receiver()), (2, 1));

    let Payload::Acts { acts, rank_info } = received.payload() else {
        panic!("unexpected payload {:?}", received.payload());
    };

    assert_eq!(acts.shape(), (2, 3));
    assert!(matches!(rank_info, Cow::Borrowed(_)));
    assert_eq!(acts.data(), &data);
}

#[tokio::test]
async fn frames_keep_their_order() {
    let (one, two) = io::duplex(64);
    let (_, tx) = io::split(one);
    let (rx, _) = io::split(two);
    let (_, mut tx) = comms::channel(io::empty(), tx);
    let (mut rx, _) = comms::channel(rx, io::sink());

    let writer = async move {
        tx.send(&Hello { rank: 4 }).await?;

        let grads = Tensor::row(vec![0.1, 0.2, 0.3]);
        tx.send(&Msg::grads(MsgKind::S2fGrads, 0, 1, grads).unwrap()).await?;
        tx.send(&Msg::signal(MsgKind::C2fProtocolFinished, 2, 1).unwrap()).await?;
        Ok::<_, std::io::Error>(())
    };

    let reader = async move {
        let mut rx_buf: Vec<u32> = Vec::new();
        let hello: Hello = rx.recv_into(&mut rx_buf).await?;
        let grads = rx.recv_into::<Msg, _>(&mut rx_buf).await?.into_owned();
        let finish = rx.recv_into::<Msg, _>(&mut rx_buf).await?.into_owned();
        Ok::<_, std::io::Error>((hello, grads, finish))
    };

    let (sent, received) = tokio::join!(writer, reader);
    sent.unwrap();
    let (hello, grads, finish) = received.unwrap();

    assert_eq!(hello.rank, 4);
    assert_eq!(grads.kind(), MsgKind::S2fGrads);
    assert_eq!(finish.kind(), MsgKind::C2fProtocolFinished);
    assert_eq!(finish.payload(), &Payload::Signal);
}

#[tokio::test]
async fn closed_stream_is_an_error() {
    let (one, two) = io::duplex(64);
    drop(one);

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut rx_buf: Vec<u32> = Vec::new();
    let err = rx.recv_into::<Msg, _>(&mut rx_buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}
