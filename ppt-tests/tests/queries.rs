use ppt_client::PptClient;
use ppt_control::{Builder, Controller, Error, status::ErrorSink};
use ppt_protocol::{Command, error::ReadError};
use ppt_tests::{FakePpt, models};

fn controller(ppt: &FakePpt, sink: &ErrorSink) -> Controller<PptClient> {
    Builder::new()
        .build(ppt.connect().unwrap(), models::registers(16))
        .with_sink(sink.clone())
}

#[test]
fn register_access() {
    let ppt = FakePpt::start().unwrap();
    let sink = ErrorSink::new();
    let mut controller = controller(&ppt, &sink);

    controller.epc_write(40, 0xdead_beef).unwrap();
    assert_eq!(controller.epc_read(40).unwrap(), 0xdead_beef);
    assert_eq!(ppt.epc(40), 0xdead_beef);

    let ctx = ppt_control::DeviceContext::new(3).unwrap();
    controller.iob_write(ctx, 0x514, 1).unwrap();
    assert_eq!(ppt.iob(3, 0x514), 1);
    assert_eq!(ppt.iob(1, 0x514), 0);
    assert_eq!(
        ppt.requests()[2],
        Command::IobWrite {
            module: 3,
            address: 0x514,
            value: 1
        }
    );
}

#[test]
fn wrong_echo_is_a_protocol_error() {
    let ppt = FakePpt::start().unwrap();
    ppt.echo_as("STAT");
    let sink = ErrorSink::new();
    let mut controller = controller(&ppt, &sink);

    let result = controller.epc_read(8);
    match result {
        Err(Error::Transport(ppt_client::Error::Protocol(ReadError::EchoMismatch {
            expected,
            got,
        }))) => {
            assert_eq!(expected, "EPCC");
            assert_eq!(got, "STAT");
        }
        other => panic!("Unexpected result {:?}", other),
    }
}

#[test]
fn status_queries() {
    let ppt = FakePpt::start().unwrap();
    ppt.set_serial(0x0012_3456_789a);
    ppt.reply_to("STAT", "4660");
    let sink = ErrorSink::new();
    let mut controller = controller(&ppt, &sink);

    assert_eq!(controller.serial_number().unwrap(), 0x0012_3456_789a);
    // only the low byte carries the status
    assert_eq!(controller.system_status().unwrap(), 0x34);
    assert_eq!(controller.temperature().unwrap(), 41);
    assert!(sink.is_empty());
}

#[test]
fn interlock_problems_are_reported() {
    let ppt = FakePpt::start().unwrap();
    let sink = ErrorSink::new();
    let mut controller = controller(&ppt, &sink);

    ppt.set_sib(vec![7, 0x4700_ff01]);
    assert_eq!(controller.sib_receive().unwrap(), vec![7, 0x4700_ff01]);
    assert!(sink.is_empty());

    ppt.set_sib(vec![0x4700_ff0f]);
    controller.sib_receive().unwrap();
    assert_eq!(
        sink.drain(),
        vec!["Safety interlock timed out during the last burst"]
    );

    ppt.set_sib(vec![0x0000_0001]);
    controller.sib_receive().unwrap();
    assert_eq!(
        sink.drain(),
        vec!["Safety interlock register could not be read"]
    );
}

#[test]
fn acquisition_commands_reach_the_ppt() {
    let ppt = FakePpt::start().unwrap();
    let sink = ErrorSink::new();
    let mut controller = controller(&ppt, &sink);

    controller.start_burst().unwrap();
    controller.start_readout().unwrap();
    controller.start_test_pattern().unwrap();
    controller.start_single_cycle().unwrap();
    assert_eq!(
        ppt.requests(),
        vec![
            Command::StartBurst,
            Command::StartReadout,
            Command::TestPattern,
            Command::SingleCycle
        ]
    );
}

#[test]
fn shell_commands_return_their_status() {
    let ppt = FakePpt::start().unwrap();
    let sink = ErrorSink::new();
    let mut controller = controller(&ppt, &sink);

    assert_eq!(controller.exec("rm /tmp/absent").unwrap(), 1);
    controller.upload_file("a.txt", b"1").unwrap();
    assert_eq!(controller.exec("mv /tmp/a.txt /tmp/b.txt").unwrap(), 0);
    assert_eq!(ppt.file("b.txt").unwrap(), b"1");
}
