//! 板卡端到端集成测试
//!
//! 用三个 mock 传输端把整块板卡跑起来，验证跨线程的完整链路：
//! 1. 传感网络帧组 → 重组快照 → 主机快照包
//! 2. 主机目标角命令 → 目标槽 → 级联控制 → 舵机写事务
//! 3. 主机标定命令 → 维护队列 → 传感总线 → 回执帧 → 主机回执包
//! 4. 关停在限时内汇合全部线程

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use manus_can::{MockCanAdapter, MockCanHandle};
use manus_driver::{Board, BoardConfig, HostPort};
use manus_protocol::{
    BUS_COUNT, CALIBRATE_OPCODE, CalibAck, CalibStatus, ENCODER_FRAME_COUNT, EncoderFrame,
    ID_BOARD_COMMAND, JOINT_COUNT, encode_calib_ack, encode_sensor_packet, encoder_frame_values,
};
use manus_servo::{MockServoHandle, MockServoPort};
use std::io;
use std::thread;
use std::time::{Duration, Instant};

/// 通道驱动的主机端口：测试侧推字节进来、收整包出去
struct ChannelHostPort {
    rx: Receiver<u8>,
    tx: Sender<Vec<u8>>,
}

impl HostPort for ChannelHostPort {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv_timeout(Duration::from_millis(1)) {
            Ok(first) => {
                buf[0] = first;
                let mut n = 1;
                while n < buf.len() {
                    match self.rx.try_recv() {
                        Ok(byte) => {
                            buf[n] = byte;
                            n += 1;
                        }
                        Err(_) => break,
                    }
                }
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let _ = self.tx.send(buf.to_vec());
        Ok(())
    }
}

struct TestRig {
    board: Board,
    can: MockCanHandle,
    servos: Vec<MockServoHandle>,
    host_tx: Sender<u8>,
    host_rx: Receiver<Vec<u8>>,
}

fn start_board() -> TestRig {
    let can = MockCanAdapter::new();
    let can_handle = can.handle();

    let mut servo_handles = Vec::new();
    let ports: Vec<MockServoPort> = (0..BUS_COUNT)
        .map(|_| {
            let port = MockServoPort::new();
            servo_handles.push(port.handle());
            port
        })
        .collect();

    // 所有舵机上电停在 0 位
    let config = BoardConfig::default();
    for entry in &config.joint_map {
        servo_handles[entry.bus].set_position(entry.id, 0);
    }

    let (host_tx, port_rx) = crossbeam_channel::unbounded::<u8>();
    let (port_tx, host_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let host_port = ChannelHostPort {
        rx: port_rx,
        tx: port_tx,
    };

    let board = Board::new(can, ports, host_port, config).unwrap();
    TestRig {
        board,
        can: can_handle,
        servos: servo_handles,
        host_tx,
        host_rx,
    }
}

/// 注入一整组编码器帧（全部关节同一读数）
fn push_encoder_group(can: &MockCanHandle, raw: u16) {
    let values = [raw; JOINT_COUNT];
    for index in 0..ENCODER_FRAME_COUNT {
        let start = index * 4;
        let count = encoder_frame_values(index);
        let frame = EncoderFrame::encode(index, &values[start..start + count]).unwrap();
        can.push_frame(frame);
    }
}

fn wait_until(mut predicate: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

/// 完整帧组注入后，主机侧收到逐字节一致的快照包
#[test]
fn test_sensor_group_reaches_host_as_snapshot_packet() {
    let rig = start_board();

    push_encoder_group(&rig.can, 2048);

    let expected = encode_sensor_packet(&[2048; JOINT_COUNT]).to_vec();
    wait_until(
        || rig.host_rx.try_iter().any(|packet| packet == expected),
        "sensor snapshot packet",
    );

    let snapshot = rig.board.snapshot();
    assert!(snapshot.valid);
    assert_eq!(snapshot.values, [2048; JOINT_COUNT]);
}

/// 主机下发目标角后，控制回路开始向舵机批量写入趋向目标的命令
#[test]
fn test_host_targets_drive_servo_commands() {
    let rig = start_board();

    // 传感 45 度，目标 90 度
    push_encoder_group(&rig.can, 2048);
    rig.host_tx.send(0xCB).unwrap();
    for angle_bytes in [90.0f32.to_le_bytes(); JOINT_COUNT] {
        for byte in angle_bytes {
            rig.host_tx.send(byte).unwrap();
        }
    }

    wait_until(
        || rig.board.targets() == [90.0; JOINT_COUNT],
        "targets to land in shared slot",
    );

    // 0 号关节挂在 0 号总线 ID 1；误差为正，命令应当朝正方向走
    wait_until(
        || {
            rig.servos[0]
                .last_command(1)
                .map(|cmd| cmd.position > 10)
                .unwrap_or(false)
        },
        "positive command toward target",
    );
}

/// 标定命令走完整来回：字节 'c' → 总线请求帧 → 回执帧 → 主机回执包
#[test]
fn test_calibration_round_trip() {
    let rig = start_board();

    rig.host_tx.send(b'c').unwrap();

    // 维护命令泵把标定请求送上传感总线
    let mut request_seen = false;
    wait_until(
        || {
            request_seen |= rig
                .can
                .take_sent_frames()
                .iter()
                .any(|f| f.id == ID_BOARD_COMMAND && f.data_slice() == [CALIBRATE_OPCODE]);
            request_seen
        },
        "calibration request frame on sensor bus",
    );

    // 板端固件应答成功
    rig.can.push_frame(
        CalibAck {
            status: CalibStatus::Success,
        }
        .to_frame(),
    );

    let expected = encode_calib_ack(CalibStatus::Success).to_vec();
    wait_until(
        || rig.host_rx.try_iter().any(|packet| packet == expected),
        "calibration ack packet",
    );

    // 回执上报一次后状态归零
    wait_until(
        || rig.board.calib_status() == CalibStatus::Idle,
        "calibration status to clear",
    );
}

/// 嵌入方 API 与主机链路写同一个目标槽
#[test]
fn test_embedder_set_targets_visible_to_control() {
    let rig = start_board();

    push_encoder_group(&rig.can, 0);
    rig.board.set_targets([45.0; JOINT_COUNT]).unwrap();
    assert_eq!(rig.board.targets(), [45.0; JOINT_COUNT]);

    wait_until(
        || {
            rig.servos[0]
                .last_command(1)
                .map(|cmd| cmd.position > 10)
                .unwrap_or(false)
        },
        "command following embedder targets",
    );
}

/// 关停在限时内汇合全部线程
#[test]
fn test_shutdown_joins_within_deadline() {
    let mut rig = start_board();
    thread::sleep(Duration::from_millis(30));
    assert!(rig.board.is_healthy());

    let start = Instant::now();
    rig.board.shutdown();
    assert!(start.elapsed() < Duration::from_secs(1), "shutdown too slow");
    assert!(!rig.board.is_running());

    // 关停后指标仍可读取
    let metrics = rig.board.metrics();
    assert!(metrics.cycles > 0);
}
