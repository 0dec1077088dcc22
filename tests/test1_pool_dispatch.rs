use std::sync::Arc;

use enigma_pool::prelude::*;
use tokio::runtime::Runtime;

fn setup(
    pool_size: usize,
    queue_size: usize,
) -> (Arc<Pool>, Arc<ScriptedFactory>, Arc<SimLoop>) {
    let factory = Arc::new(ScriptedFactory::new());
    let sim = SimLoop::new();
    let conn_opts: ConnectionOptions = [("host", "db"), ("dbname", "app")].into_iter().collect();
    let options = PoolOptionsBuilder::new()
        .pool_size(pool_size)
        .queue_size(queue_size)
        .build()
        .unwrap();
    let pool = Pool::new(
        conn_opts,
        options,
        Arc::clone(&factory) as Arc<dyn WireFactory>,
        Arc::clone(&sim) as Arc<dyn EventLoop>,
    )
    .unwrap();
    (pool, factory, sim)
}

#[test]
fn single_query_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(1, 50);
    let handle = pool.handle();

    let wait = handle.async_query(
        "SELECT * FROM t WHERE a = ? AND b = ?",
        vec![ParamValue::Int(7), ParamValue::Text("x".into())],
        QueryFlags::new(),
    )?;

    sim.run_until_idle(10);
    let result = rt.block_on(wait.wait())?;
    assert!(result.wire().is_some());

    // The wire saw the rewritten command with bound text parameters.
    let commands = factory.log().commands();
    assert_eq!(
        commands,
        vec![SentCommand::Parameterized {
            sql: "SELECT * FROM t WHERE a = $1 AND b = $2".to_string(),
            params: vec![Some("7".to_string()), Some("x".to_string())],
        }]
    );

    // The connection went back to the idle queue.
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.queued_count(), 0);
    Ok(())
}

#[test]
fn dispatch_is_fifo() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(1, 50);
    let handle = pool.handle();

    factory.hold("SELECT");
    let waits: Vec<WaitHandle> = (0..3)
        .map(|i| {
            handle.async_query(
                &format!("SELECT {i}"),
                QueryParams::None,
                QueryFlags::new(),
            )
        })
        .collect::<Result<_, _>>()?;
    factory.release("SELECT");

    sim.run_until_idle(20);
    for wait in waits {
        rt.block_on(wait.wait())?;
    }

    let sqls: Vec<String> = factory
        .log()
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            SentCommand::Parameterized { sql, .. } => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(sqls, vec!["SELECT 0", "SELECT 1", "SELECT 2"]);
    Ok(())
}

#[test]
fn queue_overflow_is_synchronous() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(1, 4);
    let handle = pool.handle();

    // Occupy the only connection, then fill the queue to capacity.
    factory.hold("slow");
    let mut waits = vec![handle.async_query("SELECT slow 0", QueryParams::None, QueryFlags::new())?];
    for i in 1..=4 {
        waits.push(handle.async_query(
            &format!("SELECT slow {i}"),
            QueryParams::None,
            QueryFlags::new(),
        )?);
    }
    assert_eq!(pool.queued_count(), 4);

    // The next submission fails synchronously.
    let err = handle
        .async_query("SELECT slow 5", QueryParams::None, QueryFlags::new())
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull));

    factory.release("slow");
    sim.run_until_idle(30);
    for wait in waits {
        rt.block_on(wait.wait())?;
    }
    assert_eq!(pool.idle_count(), 1);
    Ok(())
}

#[test]
fn cancel_while_queued_resolves_immediately() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(1, 50);
    let handle = pool.handle();

    factory.hold("slow");
    let first = handle.async_query("SELECT slow", QueryParams::None, QueryFlags::new())?;
    let second = handle.async_query("SELECT later", QueryParams::None, QueryFlags::new())?;

    // The second query is still waiting in the shared queue; cancel resolves
    // it without touching the wire.
    second.cancel();
    let err = rt.block_on(second.wait()).unwrap_err();
    assert!(matches!(err, Error::Canceled));

    factory.release("slow");
    sim.run_until_idle(20);
    rt.block_on(first.wait())?;

    // Only the first query ever reached the wire.
    assert_eq!(
        factory
            .log()
            .count(|command| matches!(command, SentCommand::Parameterized { .. })),
        1
    );
    assert_eq!(pool.idle_count(), 1);
    Ok(())
}

#[test]
fn binding_errors_are_synchronous() {
    let (pool, _factory, _sim) = setup(1, 50);
    let handle = pool.handle();

    let err = handle
        .async_query("SELECT ? WHERE a = :a", QueryParams::None, QueryFlags::new())
        .unwrap_err();
    assert!(matches!(err, Error::Parse(_)));

    let err = handle
        .async_query(
            "SELECT ?",
            vec![ParamValue::Int(1), ParamValue::Int(2)],
            QueryFlags::new(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ParameterCountMismatch { expected: 1, got: 2 }
    ));

    let err = handle
        .async_query(
            "SELECT :a",
            vec![ParamValue::Int(1)],
            QueryFlags::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::MissingParameter(_)));
}

#[test]
fn copy_kills_the_connection_and_fails_the_query() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    let (pool, factory, sim) = setup(1, 50);
    factory.respond_with("COPY", ResultStatus::CopyIn, "");
    let handle = pool.handle();

    let wait = handle.async_query("COPY t FROM STDIN", QueryParams::None, QueryFlags::new())?;
    sim.run_until_idle(10);

    let err = rt.block_on(wait.wait()).unwrap_err();
    assert!(matches!(err, Error::Query(message) if message == "Row COPY not supported"));

    let cid = pool.connection_ids()[0];
    let connection = pool.connection(cid).unwrap();
    assert_eq!(connection.state(), ConnectionState::Dead);

    // The dead connection self-heals on the next dispatch.
    let wait = handle.async_query("SELECT 1", QueryParams::None, QueryFlags::new())?;
    sim.run_until_idle(10);
    rt.block_on(wait.wait())?;
    assert_eq!(connection.state(), ConnectionState::Idle);
    Ok(())
}
