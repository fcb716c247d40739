//! Session-level protocol tests over a scripted HID transport.

mod common;

use common::*;
use std::io::Write;
use std::sync::{Arc, Mutex};
use te_lib::constants::{cmd, context, report_id};
use te_lib::hid::HidTouchEncoder;
use te_lib::hid::reports::ContextSensitiveReport;
use te_lib::types::{Clearance, ScreenId, Status, VariableData, VariableId};
use te_lib::update::{UpdateState, UpdateStatus};

fn session(hid: FakeHid) -> HidTouchEncoder<FakeHid> {
    HidTouchEncoder::new(hid)
}

fn ack_frame(command: u8, code: i8) -> Vec<u8> {
    let mut raw = vec![report_id::COMMAND_ACK, command, code as u8];
    raw.resize(11, 0);
    raw
}

fn auth_frame(state: u8, challenge: u32) -> Vec<u8> {
    let mut payload = vec![state];
    payload.extend_from_slice(&challenge.to_le_bytes());
    ContextSensitiveReport::encode(context::AUTH, &payload).unwrap()
}

#[tokio::test(start_paused = true)]
async fn interface_id_and_utility_app() {
    let (mut hid, _) = FakeHid::new("SN1234");
    hid.widget = false;
    let te = session(hid);
    assert_eq!(te.interface_id(), "usb:SN1234");
    assert!(te.in_utility_app());
}

#[tokio::test(start_paused = true)]
async fn authenticate_uses_the_fixed_hid_secret() {
    let (hid, state) = FakeHid::new("SN1");
    let mut te = session(hid);

    let challenge: u32 = 0x1122_3344;
    {
        let mut state = state.lock().unwrap();
        state.queue.push_back(hid_frame(&auth_frame(0x00, challenge)));
        state.queue.push_back(hid_frame(&auth_frame(0xFF, 0)));
    }

    assert_eq!(te.authenticate(Clearance::ServiceTool).await, Status::Success);

    let state = state.lock().unwrap();
    // Request: report 0x02, opcode, clearance, AUTH context, zero pad.
    assert_eq!(state.sent[0].0, HidEndpoint::Cmd);
    assert_eq!(
        state.sent[0].1,
        vec![0x02, cmd::ST_AUTH, 0x01, context::AUTH, 0, 0, 0, 0, 0]
    );

    // Response: a context-sensitive frame tagged RESPONSE carrying the
    // transform of the challenge under the fixed 0x1337 secret.
    let expected = challenge
        ^ (0x1337u32
            .wrapping_add(0x63F0_7B35)
            .wrapping_add(challenge << 6)
            .wrapping_add(challenge >> 2));
    let mut payload = vec![0x01];
    payload.extend_from_slice(&expected.to_le_bytes());
    assert_eq!(state.sent[1].0, HidEndpoint::Cmd);
    assert_eq!(
        state.sent[1].1,
        ContextSensitiveReport::encode(context::AUTH, &payload).unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn authenticate_bad_state_fails_the_request() {
    let (hid, state) = FakeHid::new("SN1");
    let mut te = session(hid);
    state
        .lock()
        .unwrap()
        .queue
        .push_back(hid_frame(&auth_frame(0x01, 0)));

    assert_eq!(
        te.authenticate(Clearance::ServiceTool).await,
        Status::AuthRequestFailed
    );
}

#[tokio::test(start_paused = true)]
async fn get_screen_reads_the_input_report() {
    let (hid, state) = FakeHid::new("SN1");
    let mut te = session(hid);
    state
        .lock()
        .unwrap()
        .input_reports
        .insert(0x01, vec![0x01, 0x07]);

    assert_eq!(te.get_screen().await.unwrap(), ScreenId::new(7));
    // No command-channel traffic for a screen read.
    assert!(state.lock().unwrap().sent.is_empty());
}

#[tokio::test(start_paused = true)]
async fn set_screen_nack_via_guide_error() {
    let (hid, state) = FakeHid::new("SN1");
    let mut te = session(hid);
    state
        .lock()
        .unwrap()
        .queue
        .push_back(hid_frame(&[0x20, 0x01]));

    assert_eq!(te.set_screen(ScreenId::new(4)).await, Status::Nack);
    let state = state.lock().unwrap();
    assert_eq!(state.sent[0], (HidEndpoint::Widget, vec![0x01, 0x04]));
}

#[tokio::test(start_paused = true)]
async fn set_var_matches_echoed_report() {
    let (hid, state) = FakeHid::new("SN1");
    let mut te = session(hid);
    // Echo: [VARIABLE][screen][var][size:2 LE][value]
    state
        .lock()
        .unwrap()
        .queue
        .push_back(hid_frame(&[0x02, 3, 5, 4, 0, 0x2A, 0, 0, 0]));

    let status = te
        .set_var(ScreenId::new(3), VariableId::new(5), &VariableData::from_int(42))
        .await;
    assert_eq!(status, Status::Success);

    let state = state.lock().unwrap();
    // Widget write carries a 2-byte length prefix before the value.
    assert_eq!(
        state.sent[0],
        (HidEndpoint::Widget, vec![0x02, 3, 5, 4, 0, 0x2A, 0, 0, 0])
    );
}

#[tokio::test(start_paused = true)]
async fn get_var_parses_the_sized_input_report() {
    let (hid, state) = FakeHid::new("SN1");
    let mut te = session(hid);
    state
        .lock()
        .unwrap()
        .input_reports
        .insert(0x02, vec![0x02, 3, 5, 4, 0, 0x2A, 0, 0, 0, 0xEE]);

    let value = te
        .get_var(ScreenId::new(3), VariableId::new(5))
        .await
        .unwrap();
    assert_eq!(value.to_int(), Some(42));
}

#[tokio::test(start_paused = true)]
async fn brightness_encodes_level_and_store_bit() {
    let (hid, state) = FakeHid::new("SN1");
    let mut te = session(hid);
    {
        let mut state = state.lock().unwrap();
        state.queue.push_back(hid_frame(&ack_frame(cmd::BRIGHTNESS, 1)));
        state.queue.push_back(hid_frame(&ack_frame(cmd::BRIGHTNESS, 1)));
    }

    assert_eq!(te.set_brightness(0x55, false).await, Status::Success);
    assert_eq!(te.set_brightness(0x55, true).await, Status::Success);

    let state = state.lock().unwrap();
    // Third wire byte is (level & 0x7F) | (store << 7).
    assert_eq!(state.sent[0].1[..4], [0x02, cmd::BRIGHTNESS, 0x00, 0x55]);
    assert_eq!(state.sent[1].1[..4], [0x02, cmd::BRIGHTNESS, 0x00, 0xD5]);
}

#[tokio::test(start_paused = true)]
async fn restart_maps_access_denied() {
    let (hid, state) = FakeHid::new("SN1");
    let mut te = session(hid);
    state
        .lock()
        .unwrap()
        .queue
        .push_back(hid_frame(&ack_frame(cmd::RESTART_UTILITY_APP, -2)));

    assert_eq!(te.restart(true, true, false).await, Status::AccessDenied);
}

#[tokio::test(start_paused = true)]
async fn restart_without_wait_stops_after_ack() {
    let (hid, state) = FakeHid::new("SN1");
    let mut te = session(hid);
    state
        .lock()
        .unwrap()
        .queue
        .push_back(hid_frame(&ack_frame(cmd::RESTART, 1)));

    assert_eq!(te.restart(false, false, false).await, Status::Success);
    assert_eq!(state.lock().unwrap().sent.len(), 1);
}

fn temp_package(size: usize, ext: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("te-hid-test-{}-{size}.{ext}", std::process::id()));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&vec![0x5Au8; size]).unwrap();
    path
}

#[tokio::test(start_paused = true)]
async fn update_rejected_by_device() {
    let (hid, state) = FakeHid::new("SN1");
    let mut te = session(hid);
    let path = temp_package(64, "zip");

    // HID polarity: 1 accepts, 2 rejects.
    state
        .lock()
        .unwrap()
        .queue
        .push_back(hid_frame(&ack_frame(cmd::LIVE_UPDATE, 2)));

    let log: Arc<Mutex<Vec<UpdateState>>> = Arc::new(Mutex::new(Vec::new()));
    let log_writer = Arc::clone(&log);
    let mut progress = move |state: UpdateState, _: Option<u64>, _: Option<u64>| {
        log_writer.lock().unwrap().push(state);
    };

    let status = te.update(&path, &mut progress).await.unwrap();
    assert_eq!(status, UpdateStatus::Error);
    assert!(log.lock().unwrap().contains(&UpdateState::UpdateRejected));

    // The request announced a project update (.zip) with a 3-byte size.
    let state = state.lock().unwrap();
    let request = &state.sent[0].1;
    assert_eq!(request[1], cmd::LIVE_UPDATE);
    assert_eq!(request[2], 0x03); // .zip carries a project
    assert_eq!(&request[3..6], &64u32.to_le_bytes()[..3]);
    std::fs::remove_file(&path).ok();
}

#[tokio::test(start_paused = true)]
async fn update_uploads_in_framed_chunks() {
    const FILE_SIZE: usize = 2500;
    let (hid, state) = FakeHid::new("SN1");
    let te = session(hid);
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

    state
        .lock()
        .unwrap()
        .queue
        .push_back(hid_frame(&ack_frame(cmd::LIVE_UPDATE, 1)));

    // Wait for the whole file to stream out.
    loop {
        let uploaded: usize = state
            .lock()
            .unwrap()
            .update_payloads
            .iter()
            .map(|p| p.len().saturating_sub(3))
            .sum();
        if uploaded >= FILE_SIZE {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    // Upload OK, one component pass, success (no restart required).
    {
        let mut state = state.lock().unwrap();
        state
            .queue
            .push_back(hid_frame(&[report_id::UPDATE_STATUS, 0x01, 0x00]));
        state.queue.push_back(hid_frame(&[
            report_id::UPDATE_STATUS,
            0x03,
            0x03,
            0x30,
            100,
            0,
            0,
            0,
        ]));
        state
            .queue
            .push_back(hid_frame(&[report_id::UPDATE_STATUS, 0x02, 0x03]));
    }

    let (_te, status) = task.await.unwrap();
    // SUCCESS_UPTODATE ends the call without a reboot.
    assert_eq!(status, UpdateStatus::SuccessUptodate);
    let log = log.lock().unwrap();
    let states: Vec<UpdateState> = log.iter().map(|(s, _, _)| *s).collect();
    assert!(!states.contains(&UpdateState::Rebooting));
    assert!(states.contains(&UpdateState::UpdatingProject));

    // Every upload payload is framed [UPDATE_DATA][len:2 LE][chunk ≤ 1021].
    let state = state.lock().unwrap();
    for payload in &state.update_payloads {
        assert_eq!(payload[0], report_id::UPDATE_DATA);
        let declared = u16::from_le_bytes([payload[1], payload[2]]) as usize;
        assert_eq!(declared, payload.len() - 3);
        assert!(declared <= 1021);
    }
    let total: usize = state.update_payloads.iter().map(|p| p.len() - 3).sum();
    assert_eq!(total, FILE_SIZE);

    std::fs::remove_file(&path).ok();
}
