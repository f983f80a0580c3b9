//! End-to-end canvas sessions over in-memory sockets

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use shared_canvas_server::canvas::constants::{colors, effects};
use shared_canvas_server::canvas::effects::Band;
use shared_canvas_server::canvas::grid::Grid;
use shared_canvas_server::config::ServerConfig;
use shared_canvas_server::metrics::Metrics;
use shared_canvas_server::net::canvas_session::CanvasSession;
use shared_canvas_server::net::protocol::{decode, CanvasMessage, DecodeError, EncodedFrame};
use shared_canvas_server::net::session::{self, ClientSession, FrameSink, FrameSource, SessionError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct ChannelSink(mpsc::UnboundedSender<EncodedFrame>);

impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), SessionError> {
        self.0
            .send(frame)
            .map_err(|_| SessionError::Disconnected("client gone".into()))
    }
}

struct ChannelSource(mpsc::UnboundedReceiver<Result<CanvasMessage, SessionError>>);

impl FrameSource for ChannelSource {
    async fn receive(&mut self) -> Result<CanvasMessage, SessionError> {
        self.0
            .recv()
            .await
            .unwrap_or_else(|| Err(SessionError::Disconnected("client closed".into())))
    }
}

struct TestClient {
    identity: String,
    outbox: mpsc::UnboundedSender<Result<CanvasMessage, SessionError>>,
    inbox: mpsc::UnboundedReceiver<EncodedFrame>,
    task: JoinHandle<(ClientSession, SessionError)>,
}

impl TestClient {
    fn connect(canvas: &Arc<CanvasSession>, identity: &str) -> Self {
        let (frames_tx, inbox) = mpsc::unbounded_channel();
        let (outbox, messages_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(session::run(
            canvas.clone(),
            identity.to_string(),
            ChannelSink(frames_tx),
            ChannelSource(messages_rx),
        ));
        Self {
            identity: identity.to_string(),
            outbox,
            inbox,
            task,
        }
    }

    fn send(&self, message: CanvasMessage) {
        self.outbox.send(Ok(message)).unwrap();
    }

    fn edit(&self, grid: &Grid, x: usize, y: usize) {
        self.send(CanvasMessage {
            grid: Some(Arc::new(grid.clone())),
            x: Some(x),
            y: Some(y),
            ..Default::default()
        });
    }

    async fn next(&mut self) -> CanvasMessage {
        let frame = timeout(Duration::from_secs(5), self.inbox.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("session closed");
        decode(frame.as_str()).unwrap()
    }

    async fn wait_for(&mut self, mut predicate: impl FnMut(&CanvasMessage) -> bool) -> CanvasMessage {
        loop {
            let frame = self.next().await;
            if predicate(&frame) {
                return frame;
            }
        }
    }

    async fn close(self) -> (ClientSession, SessionError) {
        drop(self.outbox);
        self.task.await.unwrap()
    }
}

fn test_config(rows: usize, cols: usize) -> ServerConfig {
    ServerConfig {
        grid_rows: rows,
        grid_cols: cols,
        broadcast_tick: Duration::from_millis(5),
        effect_step: Duration::from_millis(25),
        fill_chunk_rows: 2,
        ..Default::default()
    }
}

fn start(config: ServerConfig) -> Arc<CanvasSession> {
    let canvas = Arc::new(CanvasSession::new(&config, Arc::new(Metrics::new())));
    canvas.start_broadcast_loop();
    canvas
}

fn write_row(grid: &mut Grid, row: usize, start: usize, text: &str) {
    for (i, ch) in text.chars().enumerate() {
        grid.set(row, start + i, ch.to_string()).unwrap();
    }
}

async fn wait_for_effects(canvas: &CanvasSession, completed: u64) {
    timeout(Duration::from_secs(5), async {
        while canvas.metrics().effects_completed.load(Ordering::Relaxed) < completed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("effect did not finish");
}

#[tokio::test]
async fn test_join_colors() {
    let canvas = start(test_config(5, 5));

    let mut first = TestClient::connect(&canvas, "10.0.0.1:4000");
    assert_eq!(first.next().await.color.as_deref(), Some(colors::FIRST));

    let mut second = TestClient::connect(&canvas, "10.0.0.2:4000");
    let snapshot = second.next().await;
    assert_eq!(snapshot.color.as_deref(), Some(colors::SECOND));
    assert_eq!(snapshot.connected_clients, Some(2));
    assert_eq!(snapshot.cursors.as_ref().unwrap().len(), 2);

    let mut third = TestClient::connect(&canvas, "10.0.0.3:4000");
    let color = third.next().await.color.unwrap();
    assert!(colors::PALETTE.contains(&color.as_str()));
}

#[tokio::test]
async fn test_edit_replaces_grid_and_reaches_everyone() {
    let canvas = start(test_config(5, 5));
    let mut writer = TestClient::connect(&canvas, "10.0.0.1:4000");
    let mut reader = TestClient::connect(&canvas, "10.0.0.2:4000");
    writer.next().await;
    reader.next().await;

    let mut grid = Grid::new(5, 5);
    grid.set(0, 0, "a").unwrap();
    grid.set(4, 4, "z").unwrap();
    writer.edit(&grid, 4, 4);

    let frame = reader.wait_for(|f| f.grid.is_some()).await;
    assert_eq!(*frame.grid.unwrap(), grid);
    assert_eq!(frame.connected_clients, Some(2));
    assert_eq!(*canvas.grid(), grid);

    let cursor = &frame.cursors.unwrap()[&writer.identity];
    assert_eq!((cursor.x, cursor.y), (4, 4));
}

#[tokio::test]
async fn test_cursor_color_never_changes() {
    let canvas = start(test_config(5, 5));
    let mut client = TestClient::connect(&canvas, "10.0.0.1:4000");
    let color = client.next().await.color.unwrap();

    for (x, y) in [(1, 1), (2, 3), (4, 0)] {
        let mut grid = Grid::new(5, 5);
        grid.set(x, y, "k").unwrap();
        client.send(CanvasMessage {
            grid: Some(Arc::new(grid)),
            x: Some(x),
            y: Some(y),
            color: Some("chartreuse".into()),
            ..Default::default()
        });

        let frame = client
            .wait_for(|f| f.grid.as_ref().is_some_and(|g| g.get(x, y) == Some("k")))
            .await;
        let cursor = &frame.cursors.unwrap()[&client.identity];
        assert_eq!(cursor.color, color);
        assert_eq!((cursor.x, cursor.y), (x, y));
    }
}

#[tokio::test]
async fn test_bomb_explodes_for_every_client() {
    let canvas = start(test_config(10, 10));
    let mut bomber = TestClient::connect(&canvas, "10.0.0.1:4000");
    let mut watcher = TestClient::connect(&canvas, "10.0.0.2:4000");
    bomber.next().await;
    watcher.next().await;

    let mut grid = Grid::new(10, 10);
    write_row(&mut grid, 3, 0, "#bomb");
    grid.set(7, 7, "x").unwrap();
    bomber.edit(&grid, 3, 4);

    let mut tints = Vec::new();
    let last = loop {
        let frame = watcher.next().await;
        if let Some(bomb) = &frame.bomb {
            assert_eq!(frame.text_color.as_ref(), Some(&bomb.color));
            if tints.last() != Some(&bomb.color) {
                tints.push(bomb.color.clone());
            }
            continue;
        }
        let cleared = frame.grid.as_ref().is_some_and(|grid| grid.is_blank());
        if cleared && !tints.is_empty() {
            break frame;
        }
    };

    assert!(!tints.is_empty());
    let order: Vec<usize> = tints
        .iter()
        .map(|tint| effects::EXPLOSION_TINTS.iter().position(|t| t == tint).unwrap())
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "tints out of order: {:?}", tints);

    let grid = last.grid.unwrap();
    assert!((0..10).all(|y| grid.get(3, y) == Some("")));
    assert_eq!(last.connected_clients, Some(2));

    wait_for_effects(&canvas, 1).await;
    assert!(canvas.grid().is_blank());
}

#[tokio::test]
async fn test_fill_covers_grid_with_band_patterns() {
    let canvas = start(test_config(10, 10));
    let mut client = TestClient::connect(&canvas, "10.0.0.1:4000");
    client.next().await;

    let mut grid = Grid::new(10, 10);
    write_row(&mut grid, 5, 2, "#fill");
    grid.set(0, 9, "q").unwrap();
    client.edit(&grid, 5, 6);

    let frame = client.wait_for(|f| f.text_color.is_some()).await;
    assert_eq!(frame.text_color.as_deref(), Some(effects::FILL_TEXT_COLOR));

    wait_for_effects(&canvas, 1).await;
    let filled = canvas.grid();
    for x in 0..10 {
        for y in 0..10 {
            let cell = filled.get(x, y).unwrap();
            let allowed = Band::of(x, 10).palette();
            assert!(allowed.contains(&cell), "cell ({}, {}) = {:?}", x, y, cell);
        }
    }
}

#[tokio::test]
async fn test_malformed_messages_are_skipped() {
    let canvas = start(test_config(5, 5));
    let mut client = TestClient::connect(&canvas, "10.0.0.1:4000");
    client.next().await;

    client.outbox.send(Err(DecodeError::NotText.into())).unwrap();
    client.send(CanvasMessage {
        x: Some(1),
        y: Some(1),
        ..Default::default()
    });
    client.edit(&Grid::new(5, 5), 9, 9);
    client.edit(&Grid::new(3, 3), 0, 0);

    let mut grid = Grid::new(5, 5);
    grid.set(2, 2, "ok").unwrap();
    client.edit(&grid, 2, 2);

    let frame = client.wait_for(|f| f.grid.is_some()).await;
    assert_eq!(frame.grid.unwrap().get(2, 2), Some("ok"));
    assert_eq!(canvas.client_count(), 1);
    assert_eq!(canvas.metrics().decode_errors.load(Ordering::Relaxed), 2);
    assert_eq!(canvas.metrics().edits_rejected.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_disconnect_drops_count_by_one() {
    let canvas = start(test_config(5, 5));
    let mut stayer = TestClient::connect(&canvas, "10.0.0.1:4000");
    stayer.next().await;
    let mut leaver = TestClient::connect(&canvas, "10.0.0.2:4000");
    leaver.next().await;
    stayer.wait_for(|f| f.connected_clients == Some(2)).await;

    let (session, reason) = leaver.close().await;
    assert!(!session.is_active());
    assert!(matches!(reason, SessionError::Disconnected(_)));

    let frame = stayer.wait_for(|f| f.grid.is_none()).await;
    assert_eq!(frame.connected_clients, Some(1));

    stayer.edit(&Grid::new(5, 5), 0, 0);
    let frame = stayer.wait_for(|f| f.grid.is_some()).await;
    let cursors = frame.cursors.unwrap();
    assert_eq!(cursors.len(), 1);
    assert!(cursors.contains_key(&stayer.identity));
}

#[tokio::test]
async fn test_effect_outlives_triggering_session() {
    let canvas = start(test_config(10, 10));
    let mut bomber = TestClient::connect(&canvas, "10.0.0.1:4000");
    let mut watcher = TestClient::connect(&canvas, "10.0.0.2:4000");
    bomber.next().await;
    watcher.next().await;

    let mut grid = Grid::new(10, 10);
    write_row(&mut grid, 2, 3, "#bomb");
    bomber.edit(&grid, 2, 7);

    watcher.wait_for(|f| f.bomb.is_some()).await;
    let (session, _) = bomber.close().await;
    assert!(!session.is_active());

    let last = watcher
        .wait_for(|f| f.bomb.is_none() && f.grid.as_ref().is_some_and(|g| g.is_blank()))
        .await;
    assert_eq!(last.connected_clients, Some(1));
    let cursors = last.cursors.unwrap();
    assert_eq!(cursors.len(), 1);
    assert!(cursors.contains_key(&watcher.identity));

    wait_for_effects(&canvas, 1).await;
    assert!(canvas.grid().is_blank());
    assert_eq!(canvas.client_count(), 1);
}

/// True if every row of `grid` is either a fill row for its band or the
/// same row of one single submitted grid
fn rows_from_one_writer(grid: &Grid, submitted: &[Grid]) -> bool {
    let rows = grid.rows();
    let written: Vec<usize> = (0..rows)
        .filter(|&x| {
            let palette = Band::of(x, rows).palette();
            !grid.cells()[x].iter().all(|cell| palette.contains(&cell.as_str()))
        })
        .collect();

    submitted
        .iter()
        .any(|source| written.iter().all(|&x| grid.cells()[x] == source.cells()[x]))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edits_during_fill_never_tear() {
    const EDITORS: usize = 4;
    const EDITS: usize = 20;

    let canvas = start(test_config(10, 10));
    let mut observer = TestClient::connect(&canvas, "10.0.0.100:4000");
    observer.next().await;

    let mut trigger = Grid::new(10, 10);
    write_row(&mut trigger, 5, 2, "#fill");
    let mut submitted = vec![Grid::new(10, 10), trigger.clone()];
    for i in 0..EDITORS {
        let mut grid = Grid::new(10, 10);
        for x in 0..10 {
            for y in 0..10 {
                grid.set(x, y, format!("c{}", i)).unwrap();
            }
        }
        submitted.push(grid);
    }

    let filler = TestClient::connect(&canvas, "10.0.0.200:4000");
    filler.edit(&trigger, 5, 6);

    let editors: Vec<_> = (0..EDITORS)
        .map(|i| {
            let client = TestClient::connect(&canvas, &format!("10.0.1.{}:4000", i));
            let grid = submitted[i + 2].clone();
            tokio::spawn(async move {
                for n in 0..EDITS {
                    client.edit(&grid, n % 10, i);
                    tokio::time::sleep(Duration::from_millis(3)).await;
                }
                client
            })
        })
        .collect();

    let mut clients = Vec::new();
    for editor in editors {
        clients.push(editor.await.unwrap());
    }
    wait_for_effects(&canvas, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut seen = 0;
    while let Ok(frame) = observer.inbox.try_recv() {
        let Some(grid) = decode(frame.as_str()).unwrap().grid else {
            continue;
        };
        assert!(grid.has_shape(10, 10));
        assert!(rows_from_one_writer(&grid, &submitted), "torn grid: {:?}", grid);
        seen += 1;
    }
    assert!(seen > 0);
    assert!(rows_from_one_writer(&canvas.grid(), &submitted));

    for client in clients {
        client.close().await;
    }
    filler.close().await;
}
