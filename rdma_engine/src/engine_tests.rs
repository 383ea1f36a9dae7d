/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end tests of contexts talking over a loopback fabric.
//!
//! Every test builds a [`LoopbackEnv`]: a server listening on a port and a
//! client, each on its own device. Progress is driven by hand, so every test
//! is deterministic apart from the connection request timeout.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::connection::AddrType;
    use crate::connection::ConnectionState;
    use crate::connection::RdmaAddr;
    use crate::context::ContextState;
    use crate::datapath::DatapathOp;
    use crate::datapath::WaitMode;
    use crate::error::RdmaError;
    use crate::primitives::AccessFlags;
    use crate::primitives::Mtu;
    use crate::primitives::TaskType;
    use crate::primitives::TransportType;
    use crate::primitives::UserData;
    use crate::task::AtomicCmpSwapOp;
    use crate::task::AtomicFetchAddOp;
    use crate::task::ReadOp;
    use crate::task::ReceiveOp;
    use crate::task::ReceiveOpcode;
    use crate::task::SendImmOp;
    use crate::task::SendOp;
    use crate::task::SyncEventGetOp;
    use crate::task::SyncEventNotifyAddOp;
    use crate::task::SyncEventNotifySetOp;
    use crate::task::Task;
    use crate::task::TaskConf;
    use crate::task::TaskStatus;
    use crate::task::WriteImmOp;
    use crate::task::WriteOp;
    use crate::test_utils::CLIENT_IP;
    use crate::test_utils::ConnEvent;
    use crate::test_utils::LoopbackEnv;
    use crate::test_utils::OnRequest;
    use crate::test_utils::Recorder;
    use crate::test_utils::progress_until;
    use crate::test_utils::record_tasks;
    use crate::test_utils::server_addr;

    fn no_setup(_: &mut crate::context::Context) -> crate::error::Result<()> {
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_hello_round_trip() -> Result<(), anyhow::Error> {
        let sent = Recorder::new();
        let received = Recorder::new();
        let (s, r) = (sent.clone(), received.clone());
        let mut env = LoopbackEnv::setup(
            move |server| server.set_conf(record_tasks::<ReceiveOp>(4, &r)),
            move |client| client.set_conf(record_tasks::<SendOp>(4, &s)),
        )?;
        let (client_conn, server_conn) = env.connect(UserData(7))?;
        assert_eq!(env.client.connection_state(client_conn)?, ConnectionState::Established);
        assert_eq!(env.server.connection_state(server_conn)?, ConnectionState::Established);
        assert_eq!(
            env.client_events.snapshot(),
            vec![ConnEvent::Established(client_conn, UserData(7))]
        );
        assert_eq!(env.client.connection_user_data(client_conn)?, UserData(7));

        // The server learned where the request came from.
        let origin = env
            .server
            .connection_addr(server_conn)?
            .expect("responder records the initiator address");
        assert_eq!(origin.address(), CLIENT_IP.to_string());

        let inbox = env.server_device.register(64, AccessFlags::LOCAL_WRITE)?;
        let receive = env.server.allocate_task(
            ReceiveOp::new(Some(inbox.as_buf().into())),
            None,
            UserData(1),
        )?;
        env.server.submit(receive).unwrap();

        let payload = env
            .client_device
            .register_bytes(b"hello", AccessFlags::LOCAL_WRITE)?;
        let send = env.client.allocate_task(
            SendOp::new(Some(payload.as_buf().into())),
            Some(client_conn),
            UserData(2),
        )?;
        let receipt = env.client.submit(send).unwrap();
        assert_eq!(receipt.user_data(), UserData(2));
        assert_eq!(receipt.task_type(), TaskType::Send);
        assert_eq!(env.client.num_outstanding_tasks(), 1);

        let (s, r) = (sent.clone(), received.clone());
        env.pump_until(move |_| s.len() == 1 && r.len() == 1)?;

        let send = sent.drain().remove(0);
        assert!(send.is_success(), "{:?}", send.status());
        assert_eq!(send.user_data(), UserData(2));
        env.client.free(send)?;

        let receive = received.drain().remove(0);
        assert!(receive.is_success(), "{:?}", receive.status());
        assert_eq!(receive.user_data(), UserData(1));
        assert_eq!(receive.op().result_len(), 5);
        assert_eq!(receive.op().result_opcode(), Some(ReceiveOpcode::RecvSend));
        assert_eq!(receive.op().result_connection(), Some(server_conn));
        assert_eq!(inbox.read(0, 5)?, b"hello");
        env.server.free(receive)?;
        assert_eq!(env.server.available_tasks(TaskType::Receive), 4);
        assert_eq!(env.client.num_outstanding_tasks(), 0);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_state_changed_callback() -> Result<(), anyhow::Error> {
        let states = Recorder::new();
        let recorded = states.clone();
        let mut env = LoopbackEnv::setup(no_setup, move |client| {
            client.set_user_data(UserData(9));
            client.set_state_changed_callback(move |user_data, from, to| {
                recorded.push((user_data, from, to))
            })
        })?;
        env.client.stop()?;
        assert_eq!(env.client.state(), ContextState::Stopping);
        env.client.progress()?;
        assert_eq!(env.client.state(), ContextState::Stopped);
        assert_eq!(
            states.snapshot(),
            vec![
                (UserData(9), ContextState::Idle, ContextState::Starting),
                (UserData(9), ContextState::Starting, ContextState::Running),
                (UserData(9), ContextState::Running, ContextState::Stopping),
                (UserData(9), ContextState::Stopping, ContextState::Stopped),
            ]
        );
        env.client.reset()?;
        assert_eq!(env.client.state(), ContextState::Idle);
        env.client.progress()?;
        assert_eq!(states.len(), 5);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_task_pool_exhaustion_and_recovery() -> Result<(), anyhow::Error> {
        let writes = Recorder::new();
        let w = writes.clone();
        let mut env = LoopbackEnv::setup(no_setup, move |client| {
            client.set_conf(record_tasks::<WriteOp>(2, &w))
        })?;
        let (conn, _) = env.connect(UserData(0))?;
        let src = env.client_device.register(8, AccessFlags::LOCAL_WRITE)?;
        let target = env.server_device.register(16, AccessFlags::all())?.export()?;

        let write = |offset| WriteOp::new(src.as_buf().into(), target.slice(offset, 8).unwrap());
        let a = env.client.allocate_task(write(0), Some(conn), UserData(1))?;
        let b = env.client.allocate_task(write(8), Some(conn), UserData(2))?;
        assert!(matches!(
            env.client.allocate_task(write(0), Some(conn), UserData(3)),
            Err(RdmaError::ResourceExhausted(_))
        ));
        assert_eq!(env.client.available_tasks(TaskType::Write), 0);
        assert_eq!(env.client.task_pool_capacity(TaskType::Write), 2);

        env.client.submit(a).unwrap();
        env.client.submit(b).unwrap();
        let w = writes.clone();
        env.pump_until(move |_| w.len() == 2)?;
        // Completed tasks still hold their slots until freed.
        assert_eq!(env.client.available_tasks(TaskType::Write), 0);
        for task in writes.drain() {
            assert!(task.is_success(), "{:?}", task.status());
            env.client.free(task)?;
        }
        assert_eq!(env.client.available_tasks(TaskType::Write), 2);
        let a = env.client.allocate_task(write(0), Some(conn), UserData(4))?;
        let b = env.client.allocate_task(write(8), Some(conn), UserData(5))?;
        env.client.free(a)?;
        env.client.free(b)?;
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_submit_requires_established_connection() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup(no_setup, |client| {
            client.set_conf(TaskConf::<SendOp>::new(1, |_, _| {}, |_, _| {}))?;
            client.set_conf(TaskConf::<SendImmOp>::new(1, |_, _| {}, |_, _| {}))?;
            client.set_conf(TaskConf::<WriteOp>::new(1, |_, _| {}, |_, _| {}))?;
            client.set_conf(TaskConf::<ReadOp>::new(1, |_, _| {}, |_, _| {}))?;
            client.set_conf(TaskConf::<AtomicFetchAddOp>::new(1, |_, _| {}, |_, _| {}))?;
            client.set_conf(TaskConf::<WriteImmOp>::new(1, |_, _| {}, |_, _| {}))?;
            client.set_conf(TaskConf::<AtomicCmpSwapOp>::new(1, |_, _| {}, |_, _| {}))?;
            client.set_conf(TaskConf::<SyncEventGetOp>::new(1, |_, _| {}, |_, _| {}))?;
            client.set_conf(TaskConf::<SyncEventNotifySetOp>::new(1, |_, _| {}, |_, _| {}))?;
            client.set_conf(TaskConf::<SyncEventNotifyAddOp>::new(1, |_, _| {}, |_, _| {}))
        })?;
        // The request is still waiting for the server.
        let conn = env.client.connect_to_addr(&server_addr(), UserData(0))?;
        assert_eq!(env.client.connection_state(conn)?, ConnectionState::Connecting);

        let local = env.client_device.register(8, AccessFlags::LOCAL_WRITE)?;
        let remote = env.server_device.register(8, AccessFlags::all())?.export()?.whole();

        fn refused<K: crate::task::TaskKind>(
            ctx: &mut crate::context::Context,
            task: Task<K>,
        ) -> Result<(), anyhow::Error> {
            let err = ctx.submit(task).expect_err("submit on a connecting connection");
            assert!(matches!(err.error(), RdmaError::BadState(_)), "{}", err);
            let task = err.into_task();
            assert_eq!(task.status(), &TaskStatus::NotSubmitted);
            ctx.free(task)?;
            Ok(())
        }

        let task = env
            .client
            .allocate_task(SendOp::new(None), Some(conn), UserData(1))?;
        refused(&mut env.client, task)?;
        let task = env
            .client
            .allocate_task(SendImmOp::new(None, 3), Some(conn), UserData(1))?;
        refused(&mut env.client, task)?;
        let task = env.client.allocate_task(
            WriteOp::new(local.as_buf().into(), remote),
            Some(conn),
            UserData(1),
        )?;
        refused(&mut env.client, task)?;
        let task = env.client.allocate_task(
            ReadOp::new(remote, local.as_buf().into()),
            Some(conn),
            UserData(1),
        )?;
        refused(&mut env.client, task)?;
        let task = env.client.allocate_task(
            AtomicFetchAddOp::new(remote, local.as_buf(), 1),
            Some(conn),
            UserData(1),
        )?;
        refused(&mut env.client, task)?;
        let task = env.client.allocate_task(
            WriteImmOp::new(local.as_buf().into(), remote, 5),
            Some(conn),
            UserData(1),
        )?;
        refused(&mut env.client, task)?;
        let task = env.client.allocate_task(
            AtomicCmpSwapOp::new(remote, local.as_buf(), 0, 1),
            Some(conn),
            UserData(1),
        )?;
        refused(&mut env.client, task)?;

        let event = env.server_device.create_sync_event(0)?.export();
        let task = env.client.allocate_task(
            SyncEventGetOp::new(event, local.as_buf().into()),
            Some(conn),
            UserData(1),
        )?;
        refused(&mut env.client, task)?;
        let task = env.client.allocate_task(
            SyncEventNotifySetOp::new(event, local.as_buf()),
            Some(conn),
            UserData(1),
        )?;
        refused(&mut env.client, task)?;
        let task = env.client.allocate_task(
            SyncEventNotifyAddOp::new(event, 1, local.as_buf()),
            Some(conn),
            UserData(1),
        )?;
        refused(&mut env.client, task)?;

        // A task with no connection at all is refused too.
        let task = env.client.allocate_task(SendOp::new(None), None, UserData(1))?;
        let err = env.client.submit(task).expect_err("submit without a connection");
        assert!(matches!(err.error(), RdmaError::InvalidArgument(_)));
        env.client.free(err.into_task())?;
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_properties_are_frozen_after_start() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup(no_setup, |client| {
            // While Idle every setter takes effect and reads back.
            client.set_mtu(Mtu::Mtu1024)?;
            assert_eq!(client.mtu(), Mtu::Mtu1024);
            client.set_transport_type(TransportType::Dc)?;
            assert_eq!(client.transport_type(), TransportType::Dc);
            client.set_transport_type(TransportType::Rc)?;
            assert_eq!(client.transport_type(), TransportType::Rc);
            let permissions = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ;
            client.set_permissions(permissions)?;
            assert_eq!(client.permissions(), permissions);
            client.set_send_queue_size(64)?;
            assert_eq!(client.send_queue_size(), 64);
            Ok(())
        })?;
        assert_eq!(env.client.mtu(), Mtu::Mtu1024);
        assert_eq!(env.client.send_queue_size(), 64);
        assert!(matches!(env.client.set_sl(1), Err(RdmaError::BadState(_))));
        assert!(matches!(
            env.client.set_mtu(Mtu::Mtu2048),
            Err(RdmaError::BadState(_))
        ));
        assert!(matches!(
            env.client.set_transport_type(TransportType::Dc),
            Err(RdmaError::BadState(_))
        ));
        assert_eq!(env.client.mtu(), Mtu::Mtu1024);
        assert_eq!(env.client.transport_type(), TransportType::Rc);
        assert!(matches!(
            env.client.set_send_queue_size(8),
            Err(RdmaError::BadState(_))
        ));
        assert!(matches!(
            env.client.set_permissions(AccessFlags::REMOTE_READ),
            Err(RdmaError::BadState(_))
        ));
        assert!(matches!(
            env.client
                .set_conf(TaskConf::<SendOp>::new(1, |_, _| {}, |_, _| {})),
            Err(RdmaError::BadState(_))
        ));
        // Kinds without a configuration have no pool.
        assert!(matches!(
            env.client.allocate_task(SendOp::new(None), None, UserData(0)),
            Err(RdmaError::BadState(_))
        ));
        assert!(matches!(env.client.start(), Err(RdmaError::BadState(_))));
        assert_eq!(env.fabric.num_endpoints(), 2);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_rejected_request() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup_with(OnRequest::Reject, no_setup, no_setup)?;
        let conn = env.client.connect_to_addr(&server_addr(), UserData(5))?;
        let events = env.client_events.clone();
        env.pump_until(move |_| events.len() == 1)?;
        assert_eq!(
            env.client_events.snapshot(),
            vec![ConnEvent::Failure(conn, UserData(5))]
        );
        assert_eq!(env.client.connection_state(conn)?, ConnectionState::Rejected);
        let server_events = env.server_events.snapshot();
        assert_eq!(server_events.len(), 1);
        let server_conn = server_events[0].conn();
        assert_eq!(env.server.connection_state(server_conn)?, ConnectionState::Rejected);
        assert_eq!(env.server.num_live_connections(), 0);
        assert_eq!(env.client.num_live_connections(), 0);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_undecided_request_is_rejected() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup_with(OnRequest::Ignore, no_setup, no_setup)?;
        let conn = env.client.connect_to_addr(&server_addr(), UserData(5))?;
        let events = env.client_events.clone();
        env.pump_until(move |_| events.len() == 1)?;
        assert_eq!(
            env.client_events.snapshot(),
            vec![ConnEvent::Failure(conn, UserData(5))]
        );
        assert_eq!(env.client.connection_state(conn)?, ConnectionState::Rejected);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_accept_outside_callback_with_private_data() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup_with(OnRequest::Ignore, no_setup, no_setup)?;
        let conn = env.client.connect_to_addr(&server_addr(), UserData(1))?;
        env.server.progress()?;
        let server_conn = match env.server_events.snapshot().as_slice() {
            [ConnEvent::Request(id)] => *id,
            other => anyhow::bail!("unexpected server events {:?}", other),
        };
        assert_eq!(env.server.connection_state(server_conn)?, ConnectionState::Requested);
        assert!(matches!(
            env.server.accept(server_conn, &[0u8; 256]),
            Err(RdmaError::InvalidArgument(_))
        ));
        env.server.accept(server_conn, b"welcome")?;
        assert!(matches!(
            env.server.reject(server_conn),
            Err(RdmaError::BadState(_))
        ));
        let events = env.client_events.clone();
        env.pump_until(move |_| events.len() == 1)?;
        assert_eq!(
            env.client_events.snapshot(),
            vec![ConnEvent::Established(conn, UserData(1))]
        );
        assert_eq!(env.client.connection_private_data(conn)?, b"welcome");
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_connect_without_listener_fails() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup(no_setup, no_setup)?;
        let addr = RdmaAddr::new(AddrType::Ipv4, "10.0.0.1", 9)?;
        let conn = env.client.connect_to_addr(&addr, UserData(3))?;
        env.client.progress()?;
        assert_eq!(
            env.client_events.snapshot(),
            vec![ConnEvent::Failure(conn, UserData(3))]
        );
        assert_eq!(env.client.connection_state(conn)?, ConnectionState::Failed);

        // A failed connection frees its slot.
        env.server.stop_listen_to_port(crate::test_utils::PORT)?;
        assert!(env.server.stop_listen_to_port(crate::test_utils::PORT).is_err());
        let conn = env.client.connect_to_addr(&server_addr(), UserData(4))?;
        env.client.progress()?;
        assert_eq!(env.client.connection_state(conn)?, ConnectionState::Failed);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    async fn test_connection_request_timeout() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup(no_setup, |client| {
            client.set_connection_request_timeout_ms(20)
        })?;
        // The server never progresses, so the request is never answered.
        let conn = env.client.connect_to_addr(&server_addr(), UserData(8))?;
        let events = env.client_events.clone();
        progress_until(
            &mut env.client,
            move |_| events.len() == 1,
            Duration::from_secs(10),
        )
        .await?;
        assert_eq!(
            env.client_events.snapshot(),
            vec![ConnEvent::Failure(conn, UserData(8))]
        );
        assert_eq!(env.client.connection_state(conn)?, ConnectionState::Failed);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_connection_limit() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup(no_setup, no_setup)?;
        assert_eq!(env.client.max_num_connections(), 1);
        env.connect(UserData(0))?;
        assert!(matches!(
            env.client.connect_to_addr(&server_addr(), UserData(0)),
            Err(RdmaError::ResourceExhausted(_))
        ));
        assert_eq!(env.client.num_live_connections(), 1);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_read_and_write() -> Result<(), anyhow::Error> {
        let writes = Recorder::new();
        let reads = Recorder::new();
        let (w, r) = (writes.clone(), reads.clone());
        let mut env = LoopbackEnv::setup(no_setup, move |client| {
            client.set_conf(record_tasks::<WriteOp>(1, &w))?;
            client.set_conf(record_tasks::<ReadOp>(1, &r))
        })?;
        let (conn, _) = env.connect(UserData(0))?;
        let target = env.server_device.register(16, AccessFlags::all())?;
        let remote = target.export()?;
        let src = env
            .client_device
            .register_bytes(b"abcdefgh", AccessFlags::LOCAL_WRITE)?;
        let dst = env.client_device.register(8, AccessFlags::LOCAL_WRITE)?;

        let write = env.client.allocate_task(
            WriteOp::new(src.as_buf().into(), remote.slice(8, 8)?),
            Some(conn),
            UserData(1),
        )?;
        env.client.submit(write).unwrap();
        let w = writes.clone();
        env.pump_until(move |_| w.len() == 1)?;
        let write = writes.drain().remove(0);
        assert!(write.is_success(), "{:?}", write.status());
        env.client.free(write)?;
        assert_eq!(target.read(8, 8)?, b"abcdefgh");

        let read = env.client.allocate_task(
            ReadOp::new(remote.slice(8, 8)?, dst.as_buf().into()),
            Some(conn),
            UserData(2),
        )?;
        env.client.submit(read).unwrap();
        let r = reads.clone();
        env.pump_until(move |_| r.len() == 1)?;
        let read = reads.drain().remove(0);
        assert!(read.is_success(), "{:?}", read.status());
        assert_eq!(read.op().result_len(), 8);
        env.client.free(read)?;
        assert_eq!(dst.to_vec(), b"abcdefgh");
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_remote_permissions_are_enforced() -> Result<(), anyhow::Error> {
        let writes = Recorder::new();
        let w = writes.clone();
        let mut env = LoopbackEnv::setup(
            |server| server.set_permissions(AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ),
            move |client| client.set_conf(record_tasks::<WriteOp>(1, &w)),
        )?;
        let (conn, _) = env.connect(UserData(0))?;
        let target = env.server_device.register(8, AccessFlags::all())?;
        let src = env.client_device.register(8, AccessFlags::LOCAL_WRITE)?;
        let write = env.client.allocate_task(
            WriteOp::new(src.as_buf().into(), target.export()?.whole()),
            Some(conn),
            UserData(1),
        )?;
        env.client.submit(write).unwrap();
        let w = writes.clone();
        env.pump_until(move |_| w.len() == 1)?;
        let write = writes.drain().remove(0);
        assert!(matches!(
            write.status(),
            TaskStatus::Failed(RdmaError::RemoteAccess(_))
        ));
        env.client.free(write)?;
        // Access errors leave the connection up.
        assert_eq!(env.client.connection_state(conn)?, ConnectionState::Established);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_write_with_immediate() -> Result<(), anyhow::Error> {
        let writes = Recorder::new();
        let received = Recorder::new();
        let (w, r) = (writes.clone(), received.clone());
        let mut env = LoopbackEnv::setup(
            move |server| server.set_conf(record_tasks::<ReceiveOp>(1, &r)),
            move |client| client.set_conf(record_tasks::<WriteImmOp>(1, &w)),
        )?;
        let (conn, server_conn) = env.connect(UserData(0))?;
        let target = env.server_device.register(8, AccessFlags::all())?;
        let receive = env
            .server
            .allocate_task(ReceiveOp::new(None), None, UserData(0))?;
        env.server.submit(receive).unwrap();

        let src = env
            .client_device
            .register_bytes(&7u64.to_le_bytes(), AccessFlags::LOCAL_WRITE)?;
        let write = env.client.allocate_task(
            WriteImmOp::new(src.as_buf().into(), target.export()?.whole(), 42),
            Some(conn),
            UserData(0),
        )?;
        env.client.submit(write).unwrap();
        let (w, r) = (writes.clone(), received.clone());
        env.pump_until(move |_| w.len() == 1 && r.len() == 1)?;

        let receive = received.drain().remove(0);
        assert!(receive.is_success(), "{:?}", receive.status());
        assert_eq!(
            receive.op().result_opcode(),
            Some(ReceiveOpcode::RecvWriteWithImm)
        );
        assert_eq!(receive.op().result_immediate(), Some(42));
        assert_eq!(receive.op().result_len(), 8);
        assert_eq!(receive.op().result_connection(), Some(server_conn));
        assert_eq!(target.as_buf().read_u64()?, 7);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_atomics() -> Result<(), anyhow::Error> {
        let swaps = Recorder::new();
        let adds = Recorder::new();
        let (s, a) = (swaps.clone(), adds.clone());
        let mut env = LoopbackEnv::setup(no_setup, move |client| {
            client.set_conf(record_tasks::<AtomicCmpSwapOp>(2, &s))?;
            client.set_conf(record_tasks::<AtomicFetchAddOp>(1, &a))
        })?;
        let (conn, _) = env.connect(UserData(0))?;
        let word = env
            .server_device
            .register_bytes(&5u64.to_le_bytes(), AccessFlags::all())?;
        let remote = word.export()?.whole();
        let result = env.client_device.register(16, AccessFlags::LOCAL_WRITE)?;

        // Matching compare swaps; the second one no longer matches.
        let hit = env.client.allocate_task(
            AtomicCmpSwapOp::new(remote, result.buf(0, 8)?, 5, 9),
            Some(conn),
            UserData(1),
        )?;
        let miss = env.client.allocate_task(
            AtomicCmpSwapOp::new(remote, result.buf(8, 8)?, 5, 11),
            Some(conn),
            UserData(2),
        )?;
        env.client.submit(hit).unwrap();
        env.client.submit(miss).unwrap();
        let s = swaps.clone();
        env.pump_until(move |_| s.len() == 2)?;
        for task in swaps.drain() {
            assert!(task.is_success(), "{:?}", task.status());
            env.client.free(task)?;
        }
        assert_eq!(result.buf(0, 8)?.read_u64()?, 5);
        assert_eq!(result.buf(8, 8)?.read_u64()?, 9);
        assert_eq!(word.as_buf().read_u64()?, 9);

        let add = env.client.allocate_task(
            AtomicFetchAddOp::new(remote, result.buf(0, 8)?, 3),
            Some(conn),
            UserData(3),
        )?;
        env.client.submit(add).unwrap();
        let a = adds.clone();
        env.pump_until(move |_| a.len() == 1)?;
        let add = adds.drain().remove(0);
        assert!(add.is_success(), "{:?}", add.status());
        assert_eq!(add.op().add(), 3);
        assert_eq!(result.buf(0, 8)?.read_u64()?, 9);
        assert_eq!(word.as_buf().read_u64()?, 12);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_sync_events() -> Result<(), anyhow::Error> {
        let sets = Recorder::new();
        let adds = Recorder::new();
        let gets = Recorder::new();
        let (s, a, g) = (sets.clone(), adds.clone(), gets.clone());
        let mut env = LoopbackEnv::setup(no_setup, move |client| {
            client.set_conf(record_tasks::<SyncEventNotifySetOp>(1, &s))?;
            client.set_conf(record_tasks::<SyncEventNotifyAddOp>(1, &a))?;
            client.set_conf(record_tasks::<SyncEventGetOp>(1, &g))
        })?;
        let (conn, _) = env.connect(UserData(0))?;
        let event = env.server_device.create_sync_event(1)?;
        let remote = event.export();
        let scratch = env.client_device.register(24, AccessFlags::LOCAL_WRITE)?;
        scratch.write(0, &7u64.to_le_bytes())?;

        let set = env.client.allocate_task(
            SyncEventNotifySetOp::new(remote, scratch.buf(0, 8)?),
            Some(conn),
            UserData(1),
        )?;
        env.client.submit(set).unwrap();
        let s = sets.clone();
        env.pump_until(move |_| s.len() == 1)?;
        assert!(sets.drain()[0].is_success());
        assert_eq!(event.value(), 7);

        let add = env.client.allocate_task(
            SyncEventNotifyAddOp::new(remote, 3, scratch.buf(8, 8)?),
            Some(conn),
            UserData(2),
        )?;
        env.client.submit(add).unwrap();
        let a = adds.clone();
        env.pump_until(move |_| a.len() == 1)?;
        assert!(adds.drain()[0].is_success());
        assert_eq!(scratch.buf(8, 8)?.read_u64()?, 7);
        assert_eq!(event.value(), 10);

        let get = env.client.allocate_task(
            SyncEventGetOp::new(remote, scratch.buf(16, 8)?.into()),
            Some(conn),
            UserData(3),
        )?;
        env.client.submit(get).unwrap();
        let g = gets.clone();
        env.pump_until(move |_| g.len() == 1)?;
        let get = gets.drain().remove(0);
        assert!(get.is_success(), "{:?}", get.status());
        assert_eq!(get.op().result_len(), 8);
        assert_eq!(scratch.buf(16, 8)?.read_u64()?, 10);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_callbacks_resubmit_receives() -> Result<(), anyhow::Error> {
        let messages: Recorder<Vec<u8>> = Recorder::new();
        let sent = Recorder::new();
        let (m, s) = (messages.clone(), sent.clone());
        let mut env = LoopbackEnv::setup(
            move |server| {
                server.set_conf(TaskConf::<ReceiveOp>::new(
                    1,
                    move |progress, task| {
                        let dst = task.op().dst().map(|dst| dst.bufs()[0].clone());
                        if let Some(dst) = dst {
                            m.push(dst.read()[..task.op().result_len()].to_vec());
                        }
                        if let Err(e) = progress.submit(task) {
                            let (error, task) = e.into_parts();
                            progress.defer_error(error);
                            let _ = progress.free(task);
                        }
                    },
                    |_, task| panic!("receive failed: {:?}", task.status()),
                ))
            },
            move |client| client.set_conf(record_tasks::<SendOp>(3, &s)),
        )?;
        let (conn, _) = env.connect(UserData(0))?;
        let inbox = env.server_device.register(16, AccessFlags::LOCAL_WRITE)?;
        let receive = env.server.allocate_task(
            ReceiveOp::new(Some(inbox.as_buf().into())),
            None,
            UserData(0),
        )?;
        env.server.submit(receive).unwrap();

        let words = ["one", "two", "three"];
        let payloads = words
            .iter()
            .map(|word| env.client_device.register_bytes(word.as_bytes(), AccessFlags::LOCAL_WRITE))
            .collect::<Result<Vec<_>, _>>()?;
        for payload in &payloads {
            let send = env.client.allocate_task(
                SendOp::new(Some(payload.as_buf().into())),
                Some(conn),
                UserData(0),
            )?;
            env.client.submit(send).unwrap();
        }
        let m = messages.clone();
        env.pump_until(move |_| m.len() == 3)?;
        let received: Vec<Vec<u8>> = messages.drain();
        let expected: Vec<Vec<u8>> = words.iter().map(|w| w.as_bytes().to_vec()).collect();
        assert_eq!(received, expected);
        assert_eq!(sent.len(), 3);
        // The last repost is still outstanding.
        assert_eq!(env.server.num_outstanding_tasks(), 1);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_receiver_not_ready_exhausts_retries() -> Result<(), anyhow::Error> {
        let sent = Recorder::new();
        let received = Recorder::new();
        let (s, r) = (sent.clone(), received.clone());
        let mut env = LoopbackEnv::setup(
            move |server| {
                // Room for a single unmatched message.
                server.set_recv_queue_size(1)?;
                server.set_conf(record_tasks::<ReceiveOp>(1, &r))
            },
            move |client| {
                client.set_rnr_retry_count(2)?;
                client.set_conf(record_tasks::<SendOp>(2, &s))
            },
        )?;
        let (conn, _) = env.connect(UserData(0))?;

        let first = env
            .client_device
            .register_bytes(b"first", AccessFlags::LOCAL_WRITE)?;
        let second = env
            .client_device
            .register_bytes(b"second", AccessFlags::LOCAL_WRITE)?;
        for (payload, tag) in [(&first, 1), (&second, 2)] {
            let send = env.client.allocate_task(
                SendOp::new(Some(payload.as_buf().into())),
                Some(conn),
                UserData(tag),
            )?;
            env.client.submit(send).unwrap();
        }
        let s = sent.clone();
        env.pump_until(move |_| s.len() == 2)?;
        let mut done = sent.drain();
        let refused = done.remove(1);
        let delivered = done.remove(0);
        assert!(delivered.is_success(), "{:?}", delivered.status());
        assert_eq!(refused.user_data(), UserData(2));
        assert!(
            matches!(
                refused.status(),
                TaskStatus::Failed(RdmaError::ReceiverNotReady(_))
            ),
            "{:?}",
            refused.status()
        );
        assert_eq!(env.client.connection_state(conn)?, ConnectionState::Established);
        env.client.free(delivered)?;

        // Consuming the held message reopens the window.
        let inbox = env.server_device.register(8, AccessFlags::LOCAL_WRITE)?;
        let receive = env.server.allocate_task(
            ReceiveOp::new(Some(inbox.as_buf().into())),
            None,
            UserData(0),
        )?;
        env.server.submit(receive).unwrap();
        let r = received.clone();
        env.pump_until(move |_| r.len() == 1)?;
        let receive = received.drain().remove(0);
        assert_eq!(inbox.read(0, 5)?, b"first");

        env.client.submit(refused).unwrap();
        env.server.submit(receive).unwrap();
        let (s, r) = (sent.clone(), received.clone());
        env.pump_until(move |_| s.len() == 1 && r.len() == 1)?;
        let resent = sent.drain().remove(0);
        assert!(resent.is_success(), "{:?}", resent.status());
        assert_eq!(inbox.read(0, 6)?, b"second");
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_receiver_not_ready_waits_for_a_receive() -> Result<(), anyhow::Error> {
        let sent = Recorder::new();
        let received = Recorder::new();
        let (s, r) = (sent.clone(), received.clone());
        let mut env = LoopbackEnv::setup(
            move |server| {
                server.set_recv_queue_size(1)?;
                server.set_conf(record_tasks::<ReceiveOp>(1, &r))
            },
            // The default retry count never gives up.
            move |client| client.set_conf(record_tasks::<SendOp>(2, &s)),
        )?;
        assert_eq!(env.client.rnr_retry_count(), 7);
        let (conn, _) = env.connect(UserData(0))?;
        let payload = env
            .client_device
            .register_bytes(b"ping", AccessFlags::LOCAL_WRITE)?;
        for tag in [1, 2] {
            let send = env.client.allocate_task(
                SendOp::new(Some(payload.as_buf().into())),
                Some(conn),
                UserData(tag),
            )?;
            env.client.submit(send).unwrap();
        }
        for _ in 0..16 {
            env.pump()?;
        }
        assert_eq!(sent.len(), 1);
        assert_eq!(env.client.num_outstanding_tasks(), 1);

        let inbox = env.server_device.register(8, AccessFlags::LOCAL_WRITE)?;
        let receive = env.server.allocate_task(
            ReceiveOp::new(Some(inbox.as_buf().into())),
            None,
            UserData(0),
        )?;
        env.server.submit(receive).unwrap();
        let (s, r) = (sent.clone(), received.clone());
        env.pump_until(move |_| s.len() == 2 && r.len() == 1)?;
        let sends = sent.drain();
        assert!(sends.iter().all(|task| task.is_success()));
        assert_eq!(sends[1].user_data(), UserData(2));
        assert_eq!(env.client.num_outstanding_tasks(), 0);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_disconnect_from_either_side() -> Result<(), anyhow::Error> {
        for server_initiates in [false, true] {
            let mut env = LoopbackEnv::setup(no_setup, |client| {
                client.set_conf(TaskConf::<SendOp>::new(1, |_, _| {}, |_, _| {}))
            })?;
            let (client_conn, server_conn) = env.connect(UserData(7))?;
            env.server.set_connection_user_data(server_conn, UserData(8))?;
            let held = env
                .client
                .allocate_task(SendOp::new(None), Some(client_conn), UserData(3))?;
            if server_initiates {
                env.server.disconnect(server_conn)?;
                assert_eq!(
                    env.server.connection_state(server_conn)?,
                    ConnectionState::Disconnecting
                );
            } else {
                env.client.disconnect(client_conn)?;
            }
            for _ in 0..4 {
                env.pump()?;
            }
            let client_disconnects: Vec<ConnEvent> = env
                .client_events
                .snapshot()
                .into_iter()
                .filter(|e| matches!(e, ConnEvent::Disconnected(..)))
                .collect();
            assert_eq!(
                client_disconnects,
                vec![ConnEvent::Disconnected(client_conn, UserData(7))]
            );
            let server_disconnects: Vec<ConnEvent> = env
                .server_events
                .snapshot()
                .into_iter()
                .filter(|e| matches!(e, ConnEvent::Disconnected(..)))
                .collect();
            assert_eq!(
                server_disconnects,
                vec![ConnEvent::Disconnected(server_conn, UserData(8))]
            );

            assert_eq!(
                env.client.connection_state(client_conn)?,
                ConnectionState::Disconnected
            );
            // A task allocated while the connection was up cannot be
            // submitted on it any more.
            let err = env.client.submit(held).expect_err("submit on a disconnected connection");
            assert!(matches!(err.error(), RdmaError::BadState(_)), "{}", err);
            env.client.free(err.into_task())?;
            assert!(matches!(
                env.client
                    .allocate_task(SendOp::new(None), Some(client_conn), UserData(0)),
                Err(RdmaError::BadState(_))
            ));
            assert!(matches!(
                env.client.disconnect(client_conn),
                Err(RdmaError::BadState(_))
            ));
        }
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_disconnected_id_stays_retired_across_restart() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup(no_setup, |client| {
            client.set_conf(TaskConf::<SendOp>::new(2, |_, _| {}, |_, _| {}))
        })?;
        let (client_conn, _) = env.connect(UserData(1))?;
        env.client.disconnect(client_conn)?;
        for _ in 0..4 {
            env.pump()?;
        }
        assert_eq!(
            env.client.connection_state(client_conn)?,
            ConnectionState::Disconnected
        );

        env.client.stop()?;
        env.client.progress()?;
        assert_eq!(env.client.state(), ContextState::Stopped);
        env.client.start()?;
        env.client.progress()?;
        assert_eq!(env.client.state(), ContextState::Running);

        assert!(matches!(
            env.client
                .allocate_task(SendOp::new(None), Some(client_conn), UserData(2)),
            Err(RdmaError::BadState(_))
        ));
        let mut task = env.client.allocate_task(SendOp::new(None), None, UserData(3))?;
        task.set_connection(client_conn);
        let err = env.client.submit(task).expect_err("submit on a retired connection");
        assert!(matches!(err.error(), RdmaError::BadState(_)), "{}", err);
        env.client.free(err.into_task())?;
        assert!(matches!(
            env.client.disconnect(client_conn),
            Err(RdmaError::BadState(_))
        ));

        // Ids keep counting up after the restart.
        let next = env.client.connect_to_addr(&server_addr(), UserData(4))?;
        assert!(next > client_conn);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_simultaneous_disconnect() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup(no_setup, no_setup)?;
        let (client_conn, server_conn) = env.connect(UserData(0))?;
        env.client.disconnect(client_conn)?;
        env.server.disconnect(server_conn)?;
        for _ in 0..4 {
            env.pump()?;
        }
        let count = |events: &Recorder<ConnEvent>| {
            events
                .snapshot()
                .iter()
                .filter(|e| matches!(e, ConnEvent::Disconnected(..)))
                .count()
        };
        assert_eq!(count(&env.client_events), 1);
        assert_eq!(count(&env.server_events), 1);
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_stop_flushes_and_destroy() -> Result<(), anyhow::Error> {
        let received = Recorder::new();
        let r = received.clone();
        let mut env = LoopbackEnv::setup(
            move |server| server.set_conf(record_tasks::<ReceiveOp>(2, &r)),
            no_setup,
        )?;
        let (client_conn, server_conn) = env.connect(UserData(0))?;
        for _ in 0..2 {
            let receive = env
                .server
                .allocate_task(ReceiveOp::new(None), None, UserData(0))?;
            env.server.submit(receive).unwrap();
        }
        assert_eq!(env.server.num_outstanding_tasks(), 2);

        let LoopbackEnv {
            server,
            mut client,
            server_events,
            client_events,
            ..
        } = env;

        // Destroying a running context hands it back.
        let err = server.destroy().expect_err("destroy while running");
        assert!(matches!(err.error(), RdmaError::BadState(_)));
        let mut server = err.into_context();

        server.stop()?;
        assert!(matches!(server.progress(), Ok(n) if n > 0));
        assert_eq!(server.state(), ContextState::Stopped);
        let flushed = received.drain();
        assert_eq!(flushed.len(), 2);
        for task in flushed {
            assert_eq!(task.status(), &TaskStatus::Failed(RdmaError::Flushed));
            server.free(task)?;
        }
        assert_eq!(server.num_outstanding_tasks(), 0);
        assert_eq!(server.available_tasks(TaskType::Receive), 2);
        assert!(server_events
            .snapshot()
            .contains(&ConnEvent::Disconnected(server_conn, UserData(0))));

        // The client hears about it on its next pass.
        client.progress()?;
        assert_eq!(
            client.connection_state(client_conn)?,
            ConnectionState::Disconnected
        );
        assert!(client_events
            .snapshot()
            .contains(&ConnEvent::Disconnected(client_conn, UserData(0))));

        server.destroy().unwrap();
        client.stop()?;
        client.progress()?;
        assert_eq!(client.state(), ContextState::Stopped);
        client.destroy().unwrap();
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_exported_connection() -> Result<(), anyhow::Error> {
        let writes = Recorder::new();
        let w = writes.clone();
        let mut env = LoopbackEnv::setup(no_setup, move |client| {
            client.set_conf(record_tasks::<WriteOp>(1, &w))
        })?;
        let (client_details, client_conn) = env.client.export_connection()?;
        let (server_details, server_conn) = env.server.export_connection()?;
        assert_eq!(env.client.connection_state(client_conn)?, ConnectionState::Connecting);

        env.server.connect_exported(server_conn, &client_details)?;
        env.client.connect_exported(client_conn, &server_details)?;
        assert!(matches!(
            env.client.connect_exported(client_conn, &server_details),
            Err(RdmaError::BadState(_))
        ));
        let (c, s) = (env.client_events.clone(), env.server_events.clone());
        env.pump_until(move |_| c.len() == 1 && s.len() == 1)?;
        assert_eq!(
            env.client_events.snapshot(),
            vec![ConnEvent::Established(client_conn, UserData(0))]
        );
        assert_eq!(
            env.server_events.snapshot(),
            vec![ConnEvent::Established(server_conn, UserData(0))]
        );
        assert!(env.client.connection_addr(client_conn)?.is_none());

        let target = env.server_device.register(8, AccessFlags::all())?;
        let src = env
            .client_device
            .register_bytes(b"exported", AccessFlags::LOCAL_WRITE)?;
        let write = env.client.allocate_task(
            WriteOp::new(src.as_buf().into(), target.export()?.whole()),
            Some(client_conn),
            UserData(0),
        )?;
        env.client.submit(write).unwrap();
        let w = writes.clone();
        env.pump_until(move |_| w.len() == 1)?;
        assert!(writes.drain()[0].is_success());
        assert_eq!(target.to_vec(), b"exported");
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_corrupt_connection_details() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup(no_setup, no_setup)?;
        let (_, conn) = env.client.export_connection()?;
        assert!(matches!(
            env.client.connect_exported(conn, b"not connection details"),
            Err(RdmaError::ConnectionAborted(_))
        ));
        env.client.progress()?;
        assert_eq!(
            env.client_events.snapshot(),
            vec![ConnEvent::Failure(conn, UserData(0))]
        );
        assert_eq!(env.client.connection_state(conn)?, ConnectionState::Failed);

        // The slot is free again.
        let (mut details, conn) = env.client.export_connection()?;
        let last = details.len() - 1;
        details.truncate(last);
        assert!(env.client.connect_exported(conn, &details).is_err());
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_datapath_weak_discipline() -> Result<(), anyhow::Error> {
        let mut env = LoopbackEnv::setup(no_setup, no_setup)?;
        let (conn, server_conn) = env.connect(UserData(0))?;
        let target = env.server_device.register(24, AccessFlags::all())?;
        let remote = target.export()?;

        let mut queue = env.client.create_datapath_queue(conn, 3)?;
        assert_eq!(queue.depth(), 4);
        let range = queue.reserve(3)?;
        let ops = (0..3u8)
            .map(|i| -> anyhow::Result<DatapathOp> {
                let src = env
                    .client_device
                    .register_bytes(&[i + 1; 8], AccessFlags::LOCAL_WRITE)?;
                Ok(DatapathOp::Write(WriteOp::new(
                    src.as_buf().into(),
                    remote.slice(u64::from(i) * 8, 8)?,
                )))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let positions: Vec<_> = range.iter().collect();
        let mut ops = ops.into_iter().enumerate().collect::<Vec<_>>();
        ops.reverse();
        for (i, op) in ops {
            queue.enqueue_weak(positions[i], op)?;
        }
        queue.commit_weak(3)?;
        assert_eq!(queue.push()?, 3);

        let completions = queue.wait(3, WaitMode::Blocking)?;
        assert_eq!(completions.len(), 3);
        for (completion, position) in completions.iter().zip(&positions) {
            assert!(completion.is_valid(), "{:?}", completion.error());
            assert_eq!(completion.position(), *position);
            assert_eq!(completion.opcode(), TaskType::Write);
            assert_eq!(completion.len(), 8);
        }
        let mut expected = vec![1u8; 8];
        expected.extend([2u8; 8]);
        expected.extend([3u8; 8]);
        assert_eq!(target.to_vec(), expected);

        // Once the connection is gone the queue refuses new work.
        env.server.disconnect(server_conn)?;
        env.pump()?;
        let src = env.client_device.register(8, AccessFlags::LOCAL_WRITE)?;
        let op = DatapathOp::Write(WriteOp::new(src.as_buf().into(), remote.slice(0, 8)?));
        assert!(matches!(
            queue.enqueue_strong(op),
            Err(RdmaError::BadState(_))
        ));
        assert!(env.client.create_datapath_queue(conn, 4).is_err());
        Ok(())
    }
}
