//! Integration tests: pipes, sockets and readers exchanging bytes across
//! tasks of one event loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use spindle::io::read_to_end;
use spindle::{
    AsyncReader, AsyncWrite, BytesReader, ChunkedDecoder, ChunkedEncoder, Config, Error, EventLoop,
    InterruptibleRead, NonBlockingWritePipe, PipeSocket, Promise, buffer_with, pipe_socket_pair,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn event_loop() -> EventLoop {
    let config = Config {
        name: "streams-test".into(),
        ..Config::default()
    };
    EventLoop::new(config).unwrap()
}

fn settle(el: &mut EventLoop) {
    let handle = el.handle();
    el.block_on(handle.sleep(Duration::from_millis(5)));
}

// ── Pipe sockets ────────────────────────────────────────────────────

#[test]
fn separate_writes_concatenate_on_the_peer() {
    let mut el = event_loop();
    let handle = el.handle();
    let (client, server) = pipe_socket_pair();

    let writer = Promise::spawn(&handle, async move {
        for word in ["Hello", "World"] {
            let mut buf = BytesMut::from(word);
            server.write(&mut buf).await?;
            assert!(buf.is_empty());
        }
        server.close();
        Ok(())
    });

    let received = el.block_on(read_to_end(&client)).unwrap();
    assert_eq!(&received[..], b"HelloWorld");
    el.block_on(writer.wait()).unwrap();
}

#[test]
fn newer_read_displaces_older_read() {
    let mut el = event_loop();
    let handle = el.handle();
    let socket = Arc::new(PipeSocket::new());

    let read_once = |socket: Arc<PipeSocket>| {
        Promise::spawn(&handle, async move {
            let mut buf = BytesMut::new();
            let more = socket.read(&mut buf).await?;
            Ok((more, buf.freeze()))
        })
    };

    let older = read_once(socket.clone());
    settle(&mut el);
    let newer = read_once(socket.clone());
    settle(&mut el);

    let (more, data) = el.block_on(older.wait()).unwrap();
    assert!(more);
    assert!(data.is_empty());
    assert!(!newer.is_done());

    let mut buf = BytesMut::from("payload");
    el.block_on(socket.write(&mut buf)).unwrap();
    let (more, data) = el.block_on(newer.wait()).unwrap();
    assert!(more);
    assert_eq!(&data[..], b"payload");
}

#[test]
fn second_concurrent_write_is_rejected() {
    let mut el = event_loop();
    let handle = el.handle();
    let socket = Arc::new(PipeSocket::new());

    let writer = socket.clone();
    let first = Promise::spawn(&handle, async move {
        let mut buf = BytesMut::from("first");
        writer.write(&mut buf).await
    });
    settle(&mut el);

    let mut second = BytesMut::from("second");
    assert!(matches!(el.block_on(socket.write(&mut second)), Err(Error::DoubleWrite)));
    assert_eq!(&second[..], b"second");

    let mut buf = BytesMut::new();
    assert!(el.block_on(socket.read(&mut buf)).unwrap());
    assert_eq!(&buf[..], b"first");
    el.block_on(first.wait()).unwrap();
}

#[test]
fn closing_fails_pending_write_and_ends_reads() {
    let mut el = event_loop();
    let handle = el.handle();
    let socket = Arc::new(PipeSocket::new());

    let writer = socket.clone();
    let pending = Promise::spawn(&handle, async move {
        let mut buf = BytesMut::from("never read");
        writer.write(&mut buf).await
    });
    settle(&mut el);

    assert!(socket.close());
    assert!(!socket.close());
    assert!(matches!(el.block_on(pending.wait()), Err(Error::Closed)));

    let mut buf = BytesMut::new();
    for _ in 0..3 {
        assert!(!el.block_on(socket.read(&mut buf)).unwrap());
    }
    assert!(buf.is_empty());
}

// ── Interruptible read ──────────────────────────────────────────────

#[test]
fn interrupted_read_loses_no_data() {
    let mut el = event_loop();
    let handle = el.handle();
    let source = Arc::new(NonBlockingWritePipe::new(1024, || {}));
    let reader = Arc::new(InterruptibleRead::new(&handle, source.clone()).unwrap());

    // An interrupt with no read pending does nothing.
    assert!(!reader.interrupt());

    let pending = {
        let reader = reader.clone();
        Promise::spawn(&handle, async move {
            let mut buf = BytesMut::new();
            let more = reader.read(&mut buf).await?;
            Ok((more, buf.freeze()))
        })
    };
    settle(&mut el);
    assert!(reader.interrupt());
    let (more, data) = el.block_on(pending.wait()).unwrap();
    assert!(more);
    assert!(data.is_empty());

    // Bytes the pump is holding survive a bounced hand-off.
    source.write(b"abc").unwrap();
    settle(&mut el);
    assert!(reader.read_transient());
    settle(&mut el);
    source.write(b"def").unwrap();
    source.end();

    let all = el.block_on(read_to_end(&*reader)).unwrap();
    assert_eq!(&all[..], b"abcdef");
}

#[test]
fn interruptible_read_replays_source_error() {
    let mut el = event_loop();
    let handle = el.handle();
    let source = Arc::new(NonBlockingWritePipe::new(16, || {}));
    let reader = InterruptibleRead::new(&handle, source.clone()).unwrap();

    source.end_with(Error::Protocol("broken".into()));
    let mut buf = BytesMut::new();
    assert!(matches!(el.block_on(reader.read(&mut buf)), Err(Error::Protocol(_))));
    assert!(matches!(el.block_on(reader.read(&mut buf)), Err(Error::Protocol(_))));
}

// ── Backpressure ────────────────────────────────────────────────────

#[test]
fn producer_pauses_until_reader_drains() {
    let mut el = event_loop();
    let handle = el.handle();
    let resumed = Arc::new(AtomicUsize::new(0));
    let counter = resumed.clone();
    let pipe = Arc::new(NonBlockingWritePipe::new(4096, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut writes = 0;
    while pipe.write(&[1; 1000]).unwrap() {
        writes += 1;
    }
    assert_eq!(writes, 4);
    assert_eq!(pipe.len(), 5000);
    assert_eq!(resumed.load(Ordering::SeqCst), 0);

    let consumer = {
        let pipe = pipe.clone();
        Promise::spawn(&handle, async move {
            let mut buf = BytesMut::new();
            pipe.read(&mut buf).await?;
            Ok(buf.len())
        })
    };
    assert_eq!(el.block_on(consumer.wait()).unwrap(), 5000);
    assert_eq!(resumed.load(Ordering::SeqCst), 1);
    assert!(pipe.is_empty());
}

#[test]
fn end_of_stream_is_idempotent() {
    let mut el = event_loop();
    let pipe = NonBlockingWritePipe::new(64, || {});
    pipe.write(b"tail").unwrap();
    assert!(pipe.end());
    assert!(!pipe.end());
    assert!(!pipe.end_with(Error::Closed));
    assert!(matches!(pipe.write(b"late"), Err(Error::WriteAfterEnd)));

    let mut buf = BytesMut::new();
    assert!(el.block_on(pipe.read(&mut buf)).unwrap());
    assert_eq!(&buf[..], b"tail");
    for _ in 0..3 {
        assert!(!el.block_on(pipe.read(&mut buf)).unwrap());
    }
}

#[test]
fn read_ahead_stops_at_the_mark_and_delivers_everything() {
    let mut el = event_loop();
    let handle = el.handle();
    let source = Arc::new(NonBlockingWritePipe::new(usize::MAX, || {}));
    let buffered = buffer_with(&handle, source.clone(), 1024).unwrap();

    for _ in 0..8 {
        source.write(&[9; 512]).unwrap();
        settle(&mut el);
    }
    // The pump parks once it has pushed the mark's worth; the rest waits
    // in the source.
    assert_eq!(buffered.buffered(), 1024);
    assert_eq!(source.len(), 6 * 512);
    source.end();

    let all = el.block_on(read_to_end(&buffered)).unwrap();
    assert_eq!(all.len(), 8 * 512);
    assert!(all.iter().all(|&b| b == 9));
}

// ── Reader over sockets ─────────────────────────────────────────────

#[test]
fn lines_span_fragmented_writes() {
    let mut el = event_loop();
    let handle = el.handle();
    let (client, server) = pipe_socket_pair();

    let writer = Promise::spawn(&handle, async move {
        for fragment in ["GET / HT", "TP/1.1\r", "\nHost: exa", "mple\r\n\r\n"] {
            server.write(&mut BytesMut::from(fragment)).await?;
        }
        server.close();
        Ok(())
    });

    let mut reader = AsyncReader::new(client);
    let lines = el.block_on(async {
        let mut lines = Vec::new();
        loop {
            let line = reader.read_line().await.unwrap();
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        lines
    });
    assert_eq!(lines, ["GET / HTTP/1.1", "Host: example"]);
    el.block_on(writer.wait()).unwrap();
}

#[test]
fn chunked_body_through_encoder_and_decoder() {
    let mut el = event_loop();
    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    let encoded = AsyncReader::new(BytesReader::new(body.clone())).pipe(ChunkedEncoder::new());
    let wire = el.block_on(read_to_end(&encoded)).unwrap();
    assert!(wire.ends_with(b"0\r\n\r\n"));

    let decoded = AsyncReader::new(BytesReader::new(wire.freeze())).pipe(ChunkedDecoder::new());
    let round = el.block_on(read_to_end(&decoded)).unwrap();
    assert_eq!(&round[..], &body[..]);
}
