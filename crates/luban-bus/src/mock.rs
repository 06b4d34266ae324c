//! Mock 总线
//!
//! 无硬件依赖的 [`Transport`] 实现，用于上层测试与仿真：
//! - 每个舵机一份模拟寄存器，写入 `Goal_Position` 后经过可配置的
//!   到位时间（settle）位置跳变到目标；
//! - 故障注入：每第 N 次读失败、接下来 K 次访问失败、某个舵机永久失联。
//!
//! 内部状态在 `Arc<Mutex<..>>` 中，克隆出的句柄共享同一份状态，
//! 测试侧保留一个克隆即可在运行中注入故障、检查寄存器。

use crate::{BusError, Register, ServoId, Transport};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 注入的故障类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Voltage,
    CorruptPacket,
    PortBusy,
    Timeout,
    Protocol,
}

impl FaultKind {
    fn to_error(self, id: ServoId) -> BusError {
        match self {
            FaultKind::Voltage => BusError::Voltage { id, bits: 0x01 },
            FaultKind::CorruptPacket => BusError::CorruptPacket {
                id,
                reason: "injected".to_string(),
            },
            FaultKind::PortBusy => BusError::PortBusy("injected".to_string()),
            FaultKind::Timeout => BusError::Timeout { id },
            FaultKind::Protocol => BusError::Protocol("injected".to_string()),
        }
    }
}

#[derive(Debug)]
struct ServoState {
    position: i32,
    goal: i32,
    move_started: Option<Instant>,
    torque: i32,
    acceleration: i32,
    goal_velocity: i32,
    load: i32,
    temperature: i32,
    current: i32,
    voltage: i32,
}

impl ServoState {
    fn new(position: i32) -> Self {
        Self {
            position,
            goal: position,
            move_started: None,
            torque: 0,
            acceleration: 0,
            goal_velocity: 0,
            load: 0,
            temperature: 32,
            current: 0,
            voltage: 120,
        }
    }

    /// 到位时间过后位置跳变到目标
    fn settle(&mut self, settle: Duration) {
        if let Some(started) = self.move_started
            && started.elapsed() >= settle
        {
            self.position = self.goal;
            self.move_started = None;
        }
    }

    fn moving(&self) -> bool {
        self.move_started.is_some()
    }
}

struct MockState {
    servos: HashMap<ServoId, ServoState>,
    settle: Duration,
    connected: bool,
    dead: HashSet<ServoId>,
    fail_every_read: Option<(u64, FaultKind)>,
    fail_queue: VecDeque<FaultKind>,
    reads: u64,
    writes: u64,
    write_log: Vec<(ServoId, Register)>,
}

/// 模拟总线句柄
pub struct MockBus {
    inner: Arc<Mutex<MockState>>,
}

impl Clone for MockBus {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MockBus {
    /// 创建模拟总线，所有舵机初始位置 2048（行程中点）
    pub fn new(ids: &[ServoId]) -> Self {
        let servos = ids.iter().map(|&id| (id, ServoState::new(2048))).collect();
        Self {
            inner: Arc::new(Mutex::new(MockState {
                servos,
                settle: Duration::ZERO,
                connected: true,
                dead: HashSet::new(),
                fail_every_read: None,
                fail_queue: VecDeque::new(),
                reads: 0,
                writes: 0,
                write_log: Vec::new(),
            })),
        }
    }

    /// 设置到位时间（写入目标位置后多久位置跳变到目标）
    pub fn set_settle(&self, settle: Duration) {
        self.inner.lock().unwrap().settle = settle;
    }

    /// 直接设置当前位置（测试用）
    pub fn set_position(&self, id: ServoId, position: i32) {
        if let Some(servo) = self.inner.lock().unwrap().servos.get_mut(&id) {
            servo.position = position;
            servo.goal = position;
            servo.move_started = None;
        }
    }

    pub fn position(&self, id: ServoId) -> Option<i32> {
        self.inner.lock().unwrap().servos.get(&id).map(|s| s.position)
    }

    pub fn torque_enabled(&self, id: ServoId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .servos
            .get(&id)
            .map(|s| s.torque != 0)
            .unwrap_or(false)
    }

    pub fn goal_velocity(&self, id: ServoId) -> Option<i32> {
        self.inner.lock().unwrap().servos.get(&id).map(|s| s.goal_velocity)
    }

    pub fn acceleration(&self, id: ServoId) -> Option<i32> {
        self.inner.lock().unwrap().servos.get(&id).map(|s| s.acceleration)
    }

    /// 每第 N 次读注入一个故障（计数从 1 开始，N、2N、3N...次失败）
    pub fn fail_every_nth_read(&self, n: u64, kind: FaultKind) {
        self.inner.lock().unwrap().fail_every_read = Some((n, kind));
    }

    pub fn clear_fail_every(&self) {
        self.inner.lock().unwrap().fail_every_read = None;
    }

    /// 接下来 count 次访问（读或写）依次失败
    pub fn queue_failures(&self, count: usize, kind: FaultKind) {
        let mut state = self.inner.lock().unwrap();
        for _ in 0..count {
            state.fail_queue.push_back(kind);
        }
    }

    /// 舵机永久失联（之后对它的访问一律超时），直到 `revive_servo`
    pub fn kill_servo(&self, id: ServoId) {
        self.inner.lock().unwrap().dead.insert(id);
    }

    pub fn revive_servo(&self, id: ServoId) {
        self.inner.lock().unwrap().dead.remove(&id);
    }

    pub fn reads(&self) -> u64 {
        self.inner.lock().unwrap().reads
    }

    pub fn writes(&self) -> u64 {
        self.inner.lock().unwrap().writes
    }

    /// 成功写入的 (舵机, 寄存器) 序列，用于断言命令下发顺序
    pub fn write_log(&self) -> Vec<(ServoId, Register)> {
        self.inner.lock().unwrap().write_log.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    /// 重新接通（disconnect 之后测试复用同一实例）
    pub fn reconnect(&self) {
        self.inner.lock().unwrap().connected = true;
    }
}

impl MockState {
    fn check_faults(&mut self, id: ServoId, is_read: bool) -> Result<(), BusError> {
        if !self.connected {
            return Err(BusError::NotConnected);
        }
        if !self.servos.contains_key(&id) {
            return Err(BusError::UnknownJoint(id));
        }
        if self.dead.contains(&id) {
            return Err(BusError::Timeout { id });
        }
        if let Some(kind) = self.fail_queue.pop_front() {
            return Err(kind.to_error(id));
        }
        if is_read
            && let Some((n, kind)) = self.fail_every_read
            && n > 0
            && self.reads % n == 0
        {
            return Err(kind.to_error(id));
        }
        Ok(())
    }
}

impl Transport for MockBus {
    fn read(&mut self, reg: Register, id: ServoId) -> Result<i32, BusError> {
        let mut state = self.inner.lock().unwrap();
        state.reads += 1;
        state.check_faults(id, true)?;

        let settle = state.settle;
        let servo = state.servos.get_mut(&id).expect("checked above");
        servo.settle(settle);

        Ok(match reg {
            Register::PresentPosition => servo.position,
            Register::GoalPosition => servo.goal,
            Register::GoalVelocity => servo.goal_velocity,
            Register::Acceleration => servo.acceleration,
            Register::TorqueEnable => servo.torque,
            Register::PresentVelocity => {
                if servo.moving() {
                    servo.goal_velocity.max(1)
                } else {
                    0
                }
            },
            Register::PresentLoad => servo.load,
            Register::PresentTemperature => servo.temperature,
            Register::PresentCurrent => servo.current,
            Register::PresentVoltage => servo.voltage,
            Register::Moving => {
                if servo.moving() {
                    1
                } else {
                    0
                }
            },
        })
    }

    fn write(&mut self, reg: Register, id: ServoId, value: i32) -> Result<(), BusError> {
        let mut state = self.inner.lock().unwrap();
        state.writes += 1;
        state.check_faults(id, false)?;
        state.write_log.push((id, reg));

        let settle = state.settle;
        let servo = state.servos.get_mut(&id).expect("checked above");

        match reg {
            Register::GoalPosition => {
                servo.goal = value;
                if settle.is_zero() {
                    servo.position = value;
                    servo.move_started = None;
                } else {
                    servo.move_started = Some(Instant::now());
                }
            },
            Register::GoalVelocity => servo.goal_velocity = value,
            Register::Acceleration => servo.acceleration = value,
            Register::TorqueEnable => servo.torque = value,
            _ => {
                return Err(BusError::Protocol(format!(
                    "register {} is read-only",
                    reg.name()
                )));
            },
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.inner.lock().unwrap().connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试写目标位置后（零到位时间）位置立即到达
    #[test]
    fn test_instant_settle() {
        let mut bus = MockBus::new(&[1, 2]);
        bus.write(Register::GoalPosition, 1, 3000).unwrap();
        assert_eq!(bus.read(Register::PresentPosition, 1).unwrap(), 3000);
        assert_eq!(bus.read(Register::Moving, 1).unwrap(), 0);
        // 舵机 2 不受影响
        assert_eq!(bus.read(Register::PresentPosition, 2).unwrap(), 2048);
    }

    /// 测试到位时间内 Moving 置位、位置保持原值
    #[test]
    fn test_settle_delay() {
        let mut bus = MockBus::new(&[1]);
        bus.set_settle(Duration::from_millis(50));
        bus.write(Register::GoalPosition, 1, 1000).unwrap();

        assert_eq!(bus.read(Register::PresentPosition, 1).unwrap(), 2048);
        assert_eq!(bus.read(Register::Moving, 1).unwrap(), 1);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(bus.read(Register::PresentPosition, 1).unwrap(), 1000);
        assert_eq!(bus.read(Register::Moving, 1).unwrap(), 0);
    }

    /// 测试每第 3 次读注入欠压错误
    #[test]
    fn test_fail_every_nth_read() {
        let mut bus = MockBus::new(&[1]);
        bus.fail_every_nth_read(3, FaultKind::Voltage);

        let mut failures = 0;
        for _ in 0..12 {
            if bus.read(Register::PresentPosition, 1).is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 4); // 第 3、6、9、12 次
    }

    /// 测试失联舵机一律超时，复活后恢复
    #[test]
    fn test_dead_servo() {
        let mut bus = MockBus::new(&[1]);
        bus.kill_servo(1);
        for _ in 0..5 {
            assert!(matches!(
                bus.read(Register::PresentPosition, 1),
                Err(BusError::Timeout { id: 1 })
            ));
        }
        bus.revive_servo(1);
        assert!(bus.read(Register::PresentPosition, 1).is_ok());
    }

    /// 测试故障队列按顺序弹出
    #[test]
    fn test_fail_queue() {
        let mut bus = MockBus::new(&[1]);
        bus.queue_failures(2, FaultKind::PortBusy);

        assert!(matches!(
            bus.read(Register::PresentPosition, 1),
            Err(BusError::PortBusy(_))
        ));
        assert!(matches!(
            bus.write(Register::TorqueEnable, 1, 1),
            Err(BusError::PortBusy(_))
        ));
        assert!(bus.read(Register::PresentPosition, 1).is_ok());
    }

    /// 测试断开后访问返回 NotConnected
    #[test]
    fn test_disconnect() {
        let mut bus = MockBus::new(&[1]);
        bus.disconnect();
        assert!(matches!(
            bus.read(Register::PresentPosition, 1),
            Err(BusError::NotConnected)
        ));
        bus.reconnect();
        assert!(bus.read(Register::PresentPosition, 1).is_ok());
    }

    /// 测试未知舵机 ID
    #[test]
    fn test_unknown_joint() {
        let mut bus = MockBus::new(&[1]);
        assert!(matches!(
            bus.read(Register::PresentPosition, 9),
            Err(BusError::UnknownJoint(9))
        ));
    }
}
