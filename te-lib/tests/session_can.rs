//! Session-level protocol tests over a scripted controller application.

mod common;

use common::*;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use te_lib::can::J1939TouchEncoder;
use te_lib::can::messages::AckMsg;
use te_lib::can::name::Name;
use te_lib::constants::cmd;
use te_lib::types::{Clearance, ScreenId, Status, VariableData, VariableId};
use te_lib::update::{UpdateState, UpdateStatus};
use tokio::time::{Instant, sleep};

const DEVICE: u8 = 0x80;
const HOST: u8 = 0x21;

fn session(ca: FakeCa) -> J1939TouchEncoder<FakeCa> {
    J1939TouchEncoder::new(ca, DEVICE, Name::new(0))
}

fn ack(code: u8, group: u8) -> Vec<u8> {
    vec![code, group, 0x00, 0xEF, 0x00, 0xFF, 0xFF, 0xFF]
}

#[tokio::test(start_paused = true)]
async fn authenticate_answers_the_challenge() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);

    let challenge: u32 = 0x1122_3344;
    {
        let mut state = state.lock().unwrap();
        let mut data = vec![0x00];
        data.extend_from_slice(&challenge.to_le_bytes());
        data.extend_from_slice(&[0, 0, 0]);
        state.queue.push_back(can_msg(te_pgn::AUTHENTICATION, DEVICE, &data));
        state.queue.push_back(can_msg(te_pgn::AUTHENTICATION, DEVICE, &[0xFF, 0, 0, 0, 0]));
    }

    assert_eq!(te.authenticate(Clearance::ServiceTool).await, Status::Success);

    let state = state.lock().unwrap();
    // Request: opcode, clearance, AUTHENTICATION PGN little-endian, zero pad.
    assert_eq!(state.sent[0].0, std_pgn::PROPRIETARY_A);
    assert_eq!(state.sent[0].1, DEVICE);
    assert_eq!(state.sent[0].2, vec![0x01, 0x01, 0x00, 0x32, 0x01, 0x00, 0x00, 0x00]);

    // Response: state byte, then the transformed challenge. The CAN secret
    // is the host CA's own source address.
    let expected = challenge
        ^ ((HOST as u32)
            .wrapping_add(0x63F0_7B35)
            .wrapping_add(challenge << 6)
            .wrapping_add(challenge >> 2));
    let mut response = vec![0x01];
    response.extend_from_slice(&expected.to_le_bytes());
    assert_eq!(state.sent[1].0, te_pgn::AUTHENTICATION);
    assert_eq!(state.sent[1].2, response);
}

#[tokio::test(start_paused = true)]
async fn authenticate_already_complete_short_circuits() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);
    state
        .lock()
        .unwrap()
        .queue
        .push_back(can_msg(te_pgn::AUTHENTICATION, DEVICE, &[0xFF, 0, 0, 0, 0]));

    assert_eq!(te.authenticate(Clearance::ServiceTool).await, Status::Success);
    assert_eq!(state.lock().unwrap().sent.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn set_int_variable_matches_echo() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);
    state.lock().unwrap().queue.push_back(can_msg(
        te_pgn::GUIDE,
        DEVICE,
        &hex_to_bytes("0303052a00000000"),
    ));

    let status = te
        .set_var(ScreenId::new(3), VariableId::new(5), &VariableData::from_int(42))
        .await;
    assert_eq!(status, Status::Success);

    let state = state.lock().unwrap();
    assert_eq!(state.sent[0].0, std_pgn::PROPRIETARY_A);
    assert_eq!(state.sent[0].1, DEVICE);
    assert_eq!(state.sent[0].2, hex_to_bytes("0b0203052a000000"));
}

#[tokio::test(start_paused = true)]
async fn set_variable_nack_maps_to_nack() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);
    state
        .lock()
        .unwrap()
        .queue
        .push_back(can_msg(std_pgn::ACKNOWLEDGEMENT, DEVICE, &ack(1, 0x0B)));

    let status = te
        .set_var(ScreenId::new(3), VariableId::new(5), &VariableData::from_int(1))
        .await;
    assert_eq!(status, Status::Nack);
}

#[tokio::test(start_paused = true)]
async fn await_response_drops_frames_older_than_since() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);

    let stale = can_msg(std_pgn::ACKNOWLEDGEMENT, DEVICE, &ack(0, cmd::RESTART));
    sleep(Duration::from_millis(10)).await;
    let since = Instant::now();
    sleep(Duration::from_millis(10)).await;
    let fresh = can_msg(std_pgn::ACKNOWLEDGEMENT, DEVICE, &ack(2, cmd::RESTART));
    {
        let mut state = state.lock().unwrap();
        state.queue.push_back(stale);
        state.queue.push_back(fresh);
    }

    let ack = te
        .await_response(Duration::from_secs(1), Some(since), |m| {
            AckMsg::parse_for(m, DEVICE, cmd::RESTART)
        })
        .await
        .expect("fresh ack should match");
    // The stale OK ack was skipped; we see the later access-denied one.
    assert_eq!(ack.code, te_lib::can::messages::AckCode::AccessDenied);
}

#[tokio::test(start_paused = true)]
async fn restart_without_wait_stops_after_ack() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);
    state
        .lock()
        .unwrap()
        .queue
        .push_back(can_msg(std_pgn::ACKNOWLEDGEMENT, DEVICE, &ack(0, cmd::RESTART)));

    assert_eq!(te.restart(false, false, false).await, Status::Success);
    // One send (the restart command), no rediscovery traffic.
    assert_eq!(state.lock().unwrap().sent.len(), 1);
    assert_eq!(te.address(), DEVICE);
}

#[tokio::test(start_paused = true)]
async fn restart_times_out_without_a_new_claim() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);
    state
        .lock()
        .unwrap()
        .queue
        .push_back(can_msg(std_pgn::ACKNOWLEDGEMENT, DEVICE, &ack(0, cmd::RESTART)));

    assert_eq!(te.restart(false, true, false).await, Status::RestartTimeout);
    // The stored address is unchanged after the timeout.
    assert_eq!(te.address(), DEVICE);
}

#[tokio::test(start_paused = true)]
async fn restart_learns_the_reclaimed_address() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);
    {
        let mut state = state.lock().unwrap();
        state
            .queue
            .push_back(can_msg(std_pgn::ACKNOWLEDGEMENT, DEVICE, &ack(0, cmd::RESTART)));
        state.queue.push_back(can_msg(
            std_pgn::ADDRESS_CLAIMED,
            0x85,
            &0xBEEF_u64.to_le_bytes(),
        ));
    }

    assert_eq!(te.restart(false, true, false).await, Status::Success);
    assert_eq!(te.address(), 0x85);
    assert_eq!(te.name(), Name::new(0xBEEF));
}

#[tokio::test(start_paused = true)]
async fn restart_access_denied() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);
    state
        .lock()
        .unwrap()
        .queue
        .push_back(can_msg(std_pgn::ACKNOWLEDGEMENT, DEVICE, &ack(2, cmd::RESTART_UTILITY_APP)));

    assert_eq!(te.restart(true, true, false).await, Status::AccessDenied);
}

#[tokio::test(start_paused = true)]
async fn scan_reports_each_address_once() {
    let (mut ca, state) = FakeCa::new(HOST);
    {
        let mut state = state.lock().unwrap();
        let name = 0x77u64.to_le_bytes();
        state.queue.push_back(can_msg(std_pgn::ADDRESS_CLAIMED, 0x80, &name));
        state.queue.push_back(can_msg(std_pgn::ADDRESS_CLAIMED, 0x80, &name));
        state.queue.push_back(can_msg(std_pgn::ADDRESS_CLAIMED, 0x90, &name));
        // Unrelated traffic is skipped without ending the scan.
        state.queue.push_back(can_msg(te_pgn::GUIDE, 0x90, &[0x03, 0, 0, 0, 0, 0, 0]));
    }

    let claims = ca.scan_for_devices(Duration::from_secs(2)).await.unwrap();
    let addresses: Vec<u8> = claims.iter().map(|c| c.source_address).collect();
    assert_eq!(addresses, vec![0x80, 0x90]);

    // The scan was kicked off by a global PGN request for ADDRESS_CLAIMED.
    let state = state.lock().unwrap();
    assert_eq!(state.sent[0].0, std_pgn::PGN_REQUEST);
    assert_eq!(state.sent[0].1, 0xFF);
    assert_eq!(state.sent[0].2, std_pgn::ADDRESS_CLAIMED.to_bytes().to_vec());
}

fn temp_package(size: usize, ext: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("te-test-{}-{size}.{ext}", std::process::id()));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&vec![0xA5u8; size]).unwrap();
    path
}

#[tokio::test(start_paused = true)]
async fn update_with_unknown_extension_is_rejected_locally() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);
    let path = temp_package(16, "bin");

    let log: Arc<Mutex<Vec<UpdateState>>> = Arc::new(Mutex::new(Vec::new()));
    let log_writer = Arc::clone(&log);
    let mut progress = move |state: UpdateState, _: Option<u64>, _: Option<u64>| {
        log_writer.lock().unwrap().push(state);
    };

    let status = te.update(&path, &mut progress).await.unwrap();
    assert_eq!(status, UpdateStatus::Error);
    assert_eq!(log.lock().unwrap().as_slice(), &[UpdateState::UpdateRejected]);
    // Rejected before any device traffic.
    assert!(state.lock().unwrap().sent.is_empty());
    std::fs::remove_file(&path).ok();
}

#[tokio::test(start_paused = true)]
async fn update_rejected_by_device() {
    let (ca, state) = FakeCa::new(HOST);
    let mut te = session(ca);
    let path = temp_package(64, "tepkg");

    // Confirmation ack with status byte 2: rejected.
    state.lock().unwrap().queue.push_back(can_msg(
        std_pgn::ACKNOWLEDGEMENT,
        DEVICE,
        &[0x02, cmd::LIVE_UPDATE, 0x00, 0x33, 0x01, 0xFF, 0xFF, 0xFF],
    ));

    let log: Arc<Mutex<Vec<UpdateState>>> = Arc::new(Mutex::new(Vec::new()));
    let log_writer = Arc::clone(&log);
    let mut progress = move |state: UpdateState, _: Option<u64>, _: Option<u64>| {
        log_writer.lock().unwrap().push(state);
    };

    let status = te.update(&path, &mut progress).await.unwrap();
    assert_eq!(status, UpdateStatus::Error);
    assert!(log.lock().unwrap().contains(&UpdateState::UpdateRejected));
    std::fs::remove_file(&path).ok();
}

#[tokio::test(start_paused = true)]
async fn update_happy_path_streams_applies_and_restarts() {
    const FILE_SIZE: usize = 100_000;
    let (ca, state) = FakeCa::new(HOST);
    let te = session(ca);
    let path = temp_package(FILE_SIZE, "tepkg");

    let log: Arc<Mutex<Vec<(UpdateState, Option<u64>, Option<u64>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let log_writer = Arc::clone(&log);

    let task_path = path.clone();
    let task = tokio::spawn(async move {
        let mut te = te;
        let mut progress = move |state: UpdateState, completed: Option<u64>, total: Option<u64>| {
            log_writer.lock().unwrap().push((state, completed, total));
        };
        let status = te.update(&task_path, &mut progress).await.unwrap();
        (te, status)
    });

    // Device accepts the request (CAN polarity: 0 = accept).
    state.lock().unwrap().queue.push_back(can_msg(
        std_pgn::ACKNOWLEDGEMENT,
        DEVICE,
        &[0x00, cmd::LIVE_UPDATE, 0x00, 0x33, 0x01, 0xFF, 0xFF, 0xFF],
    ));

    // Wait until every chunk arrived on the session PGN.
    loop {
        let uploaded: usize = state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(pgn, _, _)| *pgn == te_pgn::LIVE_UPDATE)
            .map(|(_, _, data)| data.len())
            .sum();
        if uploaded >= FILE_SIZE {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }

    // Upload acknowledged, three components progress to 100, then the
    // terminal update status.
    {
        let mut state = state.lock().unwrap();
        state.queue.push_back(can_msg(te_pgn::LIVE_UPDATE, DEVICE, &[0x01, 0x00]));
        for component in [0x01u8, 0x02, 0x03] {
            state.queue.push_back(can_msg(
                te_pgn::LIVE_UPDATE,
                DEVICE,
                &[0x03, component, 0x30, 0, 0, 0, 0],
            ));
            state.queue.push_back(can_msg(
                te_pgn::LIVE_UPDATE,
                DEVICE,
                &[0x03, component, 0x30, 100, 0, 0, 0],
            ));
        }
        state.queue.push_back(can_msg(te_pgn::LIVE_UPDATE, DEVICE, &[0x02, 0x02]));
    }

    // The terminal restart: ack plus a fresh address claim.
    loop {
        let restarted = state
            .lock()
            .unwrap()
            .sent
            .iter()
            .any(|(pgn, _, data)| *pgn == std_pgn::PROPRIETARY_A && data[0] == cmd::RESTART);
        if restarted {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    {
        let mut state = state.lock().unwrap();
        state.queue.push_back(can_msg(
            std_pgn::ACKNOWLEDGEMENT,
            DEVICE,
            &[0x00, cmd::RESTART, 0x00, 0xEF, 0x00, 0xFF, 0xFF, 0xFF],
        ));
        state
            .queue
            .push_back(can_msg(std_pgn::ADDRESS_CLAIMED, DEVICE, &0x1234u64.to_le_bytes()));
    }

    let (te, status) = task.await.unwrap();
    assert_eq!(status, UpdateStatus::SuccessRestart);
    assert_eq!(te.address(), DEVICE);

    let log = log.lock().unwrap();
    let states: Vec<UpdateState> = log.iter().map(|(s, _, _)| *s).collect();
    assert!(states.contains(&UpdateState::UpdateRequest));
    assert!(states.contains(&UpdateState::UpdateConfirmation));
    assert!(states.contains(&UpdateState::UpdatingBootloader));
    assert!(states.contains(&UpdateState::UpdatingFirmware));
    assert!(states.contains(&UpdateState::UpdatingProject));
    assert!(states.contains(&UpdateState::Rebooting));

    // Upload progress is monotonically non-decreasing and reaches the file size.
    let uploads: Vec<u64> = log
        .iter()
        .filter(|(s, c, _)| *s == UpdateState::FileUpload && c.is_some())
        .map(|(_, c, _)| c.unwrap())
        .collect();
    assert!(uploads.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(uploads.last(), Some(&(FILE_SIZE as u64)));

    // The request announced the package type and 3-byte size.
    let state = state.lock().unwrap();
    let request = &state.sent[0].2;
    assert_eq!(request[0], cmd::LIVE_UPDATE);
    assert_eq!(request[1], 0x00); // .tepkg is a full package
    assert_eq!(&request[2..5], &(FILE_SIZE as u32).to_le_bytes()[..3]);
    assert_eq!(&request[5..8], &te_pgn::LIVE_UPDATE.to_bytes());

    std::fs::remove_file(&path).ok();
}
