mod common;

use std::io::Cursor;
use std::sync::{atomic::Ordering, Arc};
use std::time::{Duration, Instant};

use cadenza_core::remote::OutboundMessage;
use cadenza_core::{
    CadenzaError, Credentials, GenerationConfig, NullOutput, PcmFormat, SessionConfig,
    SessionController, SessionState, StreamConnector, ToneConnector, WeightedPrompt,
};
use common::{
    controller, controller_with, patterned, test_config, wait_until, CapturingOutput,
    ScriptedConnector,
};

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn operations_before_connect_are_rejected() {
    let connector = ScriptedConnector::new();
    let session = controller(&connector, Arc::new(NullOutput));

    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(
        session.set_prompts(vec![WeightedPrompt::new("ambient", 1.0)]),
        Err(CadenzaError::NotConnected)
    ));
    assert!(matches!(session.play(), Err(CadenzaError::NotConnected)));
    assert!(session.close().is_ok());
    assert_eq!(connector.opens.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_connect_is_reported_and_sticks_until_close() {
    let connector = ScriptedConnector::new();
    connector.script.fail_open.store(true, Ordering::SeqCst);
    let session = controller(&connector, Arc::new(NullOutput));

    let err = session.connect().expect_err("open failure must surface");
    assert!(matches!(err, CadenzaError::ConnectFailed(_)));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(!session.is_connected());

    assert!(matches!(
        session.connect(),
        Err(CadenzaError::InvalidState(SessionState::Failed))
    ));

    session.close().expect("close after failure");
    assert_eq!(session.state(), SessionState::Disconnected);

    connector.script.fail_open.store(false, Ordering::SeqCst);
    session.connect().expect("connect after recovery");
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    session.close().expect("close");
}

#[test]
fn hung_open_times_out() {
    let connector = ScriptedConnector::new();
    connector.script.hang_open.store(true, Ordering::SeqCst);
    let config = SessionConfig {
        connect_timeout_ms: 100,
        ..test_config()
    };
    let session = controller_with(config, &connector, Arc::new(NullOutput));

    let started = Instant::now();
    let err = session.connect().expect_err("hung open must time out");
    assert!(matches!(err, CadenzaError::ConnectTimeout(_)));
    assert!(started.elapsed() < WAIT);
    assert_eq!(session.state(), SessionState::Failed);

    session.close().expect("close");
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn headless_session_still_records() {
    let connector = ScriptedConnector::new();
    let session = controller(&connector, Arc::new(NullOutput));
    session.connect().expect("connect");

    assert!(!session.audio_enabled());
    assert!(session.is_connected());
    assert_eq!(connector.api_key().as_deref(), Some("test-key"));

    connector.push_audio(&[patterned(100, 1), patterned(200, 2)]);
    assert!(wait_until(WAIT, || session.recording_bytes().len() == 300));
    assert_eq!(session.buffered_bytes(), 0);

    session.play_test_tone(Duration::from_millis(50)).expect("submit tone");
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(session.buffered_bytes(), 0);

    session.close().expect("close");
}

#[test]
fn inbound_audio_reaches_playback_and_recording_in_order() {
    let connector = ScriptedConnector::new();
    let output = CapturingOutput::new();
    let session = controller(&connector, output.clone());
    session.connect().expect("connect");
    assert!(session.audio_enabled());
    let mut reader = output.take_reader().expect("output opened");

    let chunks = vec![patterned(100, 1), patterned(50, 2), patterned(80, 3)];
    let all: Vec<u8> = chunks.concat();
    connector.push_audio(&chunks);
    assert!(wait_until(WAIT, || session.recording_bytes().len() == 230));
    assert_eq!(session.recording_bytes(), all);

    assert_eq!(reader.pull(120), &all[..120]);
    assert_eq!(session.buffered_bytes(), 110);

    let tail = reader.pull(200);
    assert_eq!(&tail[..110], &all[120..]);
    assert!(tail[110..].iter().all(|b| *b == 0));

    let diagnostics = session.diagnostics_snapshot();
    assert_eq!(diagnostics.messages_in, 1);
    assert_eq!(diagnostics.chunks_in, 3);
    assert_eq!(diagnostics.bytes_in, 230);
    assert_eq!(diagnostics.underruns, 1);
    assert_eq!(diagnostics.recorded_bytes, 230);

    session.close().expect("close");
    assert!(output.stopped.load(Ordering::SeqCst));
}

#[test]
fn reset_clears_local_audio_before_the_remote_ack() {
    let connector = ScriptedConnector::new();
    let output = CapturingOutput::new();
    let session = controller(&connector, output.clone());
    session.connect().expect("connect");
    let mut reader = output.take_reader().expect("output opened");

    connector.push_audio(&[patterned(300, 4)]);
    assert!(wait_until(WAIT, || session.recording_bytes().len() == 300));

    let release = connector.hold_next_reset();
    session.reset().expect("submit reset");
    assert!(wait_until(WAIT, || {
        connector.count(|m| *m == OutboundMessage::ResetContext) == 1
    }));

    // Remote ack still pending here.
    assert!(session.recording_bytes().is_empty());
    assert_eq!(session.buffered_bytes(), 0);
    assert!(reader.pull(64).iter().all(|b| *b == 0));

    release.send(()).expect("reset still waiting");
    let fresh = patterned(40, 9);
    connector.push_audio(&[fresh.clone()]);
    assert!(wait_until(WAIT, || session.recording_bytes().len() == 40));
    assert_eq!(reader.pull(40), fresh);

    session.close().expect("close");
}

#[test]
fn stream_end_marks_connection_lost() {
    let connector = ScriptedConnector::new();
    let session = controller(&connector, Arc::new(NullOutput));
    let mut status = session.subscribe_status();
    session.connect().expect("connect");

    connector.end_stream();

    let mut lost_detail = None;
    assert!(wait_until(WAIT, || {
        while let Ok(event) = status.try_recv() {
            if !event.connected && event.detail.is_some() {
                lost_detail = event.detail;
            }
        }
        lost_detail.is_some()
    }));
    assert!(!session.is_connected());
    assert!(lost_detail.unwrap_or_default().contains("stream ended"));

    // Still accepted, kept locally, never sent.
    let prompts = vec![WeightedPrompt::new("lofi", 0.8)];
    session.set_prompts(prompts.clone()).expect("submit prompts");
    assert!(wait_until(WAIT, || session.prompts() == prompts));
    assert!(connector.log().is_empty());

    session.close().expect("close");
}

#[test]
fn send_failure_marks_connection_lost_without_raising() {
    let connector = ScriptedConnector::new();
    let session = controller(&connector, Arc::new(NullOutput));
    session.connect().expect("connect");

    connector.script.fail_sends.store(true, Ordering::SeqCst);
    let prompts = vec![WeightedPrompt::new("piano", 1.0)];
    session.set_prompts(prompts.clone()).expect("submission itself succeeds");

    assert!(wait_until(WAIT, || !session.is_connected()));
    assert_eq!(session.prompts(), prompts);
    assert!(connector.log().is_empty());

    session.close().expect("close");
}

#[test]
fn play_and_stop_track_state() {
    let connector = ScriptedConnector::new();
    let session = controller(&connector, Arc::new(NullOutput));
    session.connect().expect("connect");

    session.play().expect("play");
    assert!(wait_until(WAIT, || session.state() == SessionState::Playing));
    assert!(session.is_playing());

    session.stop().expect("stop");
    assert!(wait_until(WAIT, || session.state() == SessionState::Stopped));
    assert!(!session.is_playing());

    assert_eq!(
        connector.log(),
        vec![OutboundMessage::Play, OutboundMessage::Stop]
    );
    session.close().expect("close");
}

#[test]
fn invalid_config_is_rejected_before_transmission() {
    let connector = ScriptedConnector::new();
    let session = controller(&connector, Arc::new(NullOutput));
    session.connect().expect("connect");

    let too_fast = GenerationConfig {
        bpm: Some(250),
        ..Default::default()
    };
    assert!(matches!(
        session.set_config(too_fast),
        Err(CadenzaError::InvalidConfig(_))
    ));
    let too_much_guidance = GenerationConfig {
        guidance: Some(7.5),
        ..Default::default()
    };
    assert!(matches!(
        session.update_config_with_reset(too_much_guidance),
        Err(CadenzaError::InvalidConfig(_))
    ));

    let valid = GenerationConfig {
        bpm: Some(120),
        density: Some(0.4),
        ..Default::default()
    };
    session.set_config(valid.clone()).expect("valid config");
    assert!(wait_until(WAIT, || connector.log().len() == 1));
    assert_eq!(connector.log(), vec![OutboundMessage::SetConfig(valid.clone())]);
    assert_eq!(session.generation_config(), Some(valid));

    session.close().expect("close");
}

#[test]
fn test_tone_is_queued_for_playback_only() {
    let connector = ScriptedConnector::new();
    let output = CapturingOutput::new();
    let session = controller(&connector, output.clone());
    session.connect().expect("connect");

    session
        .play_test_tone(Duration::from_millis(100))
        .expect("submit tone");
    // 800 mono frames at 8 kHz.
    assert!(wait_until(WAIT, || session.buffered_bytes() == 1_600));
    assert!(session.recording_bytes().is_empty());

    session.close().expect("close");
}

#[test]
fn recording_exports_as_wav() {
    let connector = ScriptedConnector::new();
    let session = controller(&connector, Arc::new(NullOutput));
    session.connect().expect("connect");

    connector.push_audio(&[patterned(400, 5)]);
    assert!(wait_until(WAIT, || session.recording_bytes().len() == 400));
    approx::assert_abs_diff_eq!(session.recording_duration_secs(), 0.025, epsilon = 1e-9);

    let wav = session.recording_wav().expect("encode recording");
    assert_eq!(wav.len(), 444);
    let reader = hound::WavReader::new(Cursor::new(wav)).expect("valid wav");
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 8_000);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len(), 200);

    let path = std::env::temp_dir().join(format!(
        "cadenza-recording-{}.wav",
        std::process::id()
    ));
    session.save_recording(&path).expect("save recording");
    let written = std::fs::read(&path).expect("read back");
    let _ = std::fs::remove_file(&path);
    assert_eq!(written.len(), 444);

    session.clear_recording();
    assert!(wait_until(WAIT, || session.recording_bytes().is_empty()));

    session.close().expect("close");
}

#[test]
fn close_racing_submissions_never_sends_after_teardown() {
    let connector = ScriptedConnector::new();
    let session = Arc::new(controller(&connector, Arc::new(NullOutput)));
    session.connect().expect("connect");

    let spammer = {
        let session = Arc::clone(&session);
        std::thread::spawn(move || {
            let mut accepted = 0usize;
            loop {
                match session.set_prompts(vec![WeightedPrompt::new("drone", 1.0)]) {
                    Ok(()) => accepted += 1,
                    Err(e) => return (accepted, e),
                }
                std::thread::sleep(Duration::from_micros(200));
            }
        })
    };

    std::thread::sleep(Duration::from_millis(20));
    session.close().expect("close");
    let (_, err) = spammer.join().expect("spammer thread");

    assert!(matches!(err, CadenzaError::NotConnected));
    assert_eq!(connector.sends_after_close.load(Ordering::SeqCst), 0);
    assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn hung_remote_close_is_bounded() {
    let connector = ScriptedConnector::new();
    connector.script.hang_close.store(true, Ordering::SeqCst);
    let config = SessionConfig {
        close_timeout_ms: 100,
        ..test_config()
    };
    let session = controller_with(config, &connector, Arc::new(NullOutput));
    session.connect().expect("connect");

    let started = Instant::now();
    session.close().expect("close");
    assert!(started.elapsed() < WAIT);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.is_connected());
}

#[test]
fn reconnect_starts_a_fresh_session() {
    let connector = ScriptedConnector::new();
    let output = CapturingOutput::new();
    let session = controller(&connector, output.clone());

    session.connect().expect("first connect");
    session
        .set_prompts(vec![WeightedPrompt::new("jazz", 1.0)])
        .expect("prompts");
    connector.push_audio(&[patterned(120, 6)]);
    assert!(wait_until(WAIT, || session.recording_bytes().len() == 120));
    assert!(wait_until(WAIT, || !session.prompts().is_empty()));
    session.close().expect("close");

    session.connect().expect("second connect");
    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.prompts().is_empty());
    assert!(session.recording_bytes().is_empty());
    assert_eq!(session.generation_config(), None);
    assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    assert_eq!(output.opens.load(Ordering::SeqCst), 2);

    assert!(matches!(
        session.connect(),
        Err(CadenzaError::InvalidState(SessionState::Connected))
    ));
    session.close().expect("close");
}

#[test]
fn audio_beyond_ring_capacity_drains_in_order() {
    let connector = ScriptedConnector::new();
    let output = CapturingOutput::new();
    let session = controller(&connector, output.clone());
    session.connect().expect("connect");
    let mut reader = output.take_reader().expect("output opened");

    // The ring holds one second (16 000 bytes); the rest has to spill.
    let chunks: Vec<Vec<u8>> = (0..6).map(|i| patterned(4_000, i)).collect();
    let all = chunks.concat();
    connector.push_audio(&chunks);
    assert!(wait_until(WAIT, || session.recording_bytes().len() == all.len()));
    assert!(session.diagnostics_snapshot().spilled_bytes > 0);
    assert_eq!(session.buffered_bytes(), all.len());

    let mut played = Vec::with_capacity(all.len());
    let mut frame = [0u8; 1_000];
    assert!(wait_until(WAIT, || {
        let n = reader.pull_into(&mut frame);
        played.extend_from_slice(&frame[..n]);
        played.len() >= all.len()
    }));
    assert_eq!(played, all);
    assert_eq!(session.buffered_bytes(), 0);

    session.close().expect("close");
}

#[test]
fn tone_connector_session_streams_audio() {
    let config = SessionConfig {
        format: PcmFormat::new(8_000, 1),
        ..test_config()
    };
    let connector = ToneConnector::new(config.format).with_chunk_duration(Duration::from_millis(50));
    let session = SessionController::new(
        config,
        Arc::new(connector) as Arc<dyn StreamConnector>,
        Arc::new(NullOutput),
        Credentials::default(),
    );
    session.connect().expect("connect");
    session.play().expect("play");

    // Four 50 ms chunks at 8 kHz mono.
    assert!(wait_until(WAIT, || session.diagnostics_snapshot().chunks_in >= 4));
    assert!(session.recording_bytes().len() >= 4 * 800);
    assert!(session.is_playing());

    session.close().expect("close");
}

#[test]
fn unusable_pcm_format_is_refused_before_connecting() {
    let connector = ScriptedConnector::new();
    let config = SessionConfig {
        format: PcmFormat::new(48_000, 0),
        ..test_config()
    };
    let session = controller_with(config, &connector, Arc::new(NullOutput));

    assert!(matches!(
        session.connect(),
        Err(CadenzaError::InvalidSessionConfig(_))
    ));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(connector.opens.load(Ordering::SeqCst), 0);
}

#[test]
fn late_connect_after_caller_timeout_releases_playback() {
    let connector = ScriptedConnector::new();
    let output = CapturingOutput::new();
    // Caller gives up after connect timeout + 500 ms; the device outlasts that.
    output.open_delay_ms.store(900, Ordering::SeqCst);
    let config = SessionConfig {
        connect_timeout_ms: 100,
        ..test_config()
    };
    let session = controller_with(config, &connector, output.clone());

    let err = session.connect().expect_err("caller wait must expire");
    assert!(matches!(err, CadenzaError::ConnectTimeout(_)));
    assert_eq!(session.state(), SessionState::Failed);

    assert!(wait_until(WAIT, || output.stopped.load(Ordering::SeqCst)));
    assert!(wait_until(WAIT, || connector.closes.load(Ordering::SeqCst) == 1));
    assert!(!session.audio_enabled());
    assert!(!session.is_connected());
    assert_eq!(session.buffered_bytes(), 0);
    assert_eq!(session.state(), SessionState::Failed);

    session.close().expect("close");
    assert_eq!(session.state(), SessionState::Disconnected);
}
