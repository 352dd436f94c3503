// Tests for bracket forwarding across synchronous and delayed completions
#[cfg(test)]
mod tests {
    use crate::core::{
        components::{BracketSide, Component, ComponentConfig},
        connections::{Socket, SocketEvent},
        ports::{InPortConfig, OutPortConfig},
        scheduler::Scheduler,
        values::{Packet, PacketKind},
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use serde_json::{json, Value};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn label(ip: &Packet) -> String {
        match ip.kind {
            PacketKind::OpenBracket => format!("<{}", ip.data.as_str().unwrap_or_default()),
            PacketKind::CloseBracket => format!(">{}", ip.data.as_str().unwrap_or_default()),
            PacketKind::Data => ip.data.to_string(),
        }
    }

    fn capture(component: &Component, port: &str) -> Rc<RefCell<Vec<String>>> {
        let socket = Socket::new(Value::Null);
        component
            .out_port(port)
            .unwrap()
            .attach(&socket, None)
            .unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        socket.events().subscribe("ip", move |event| {
            if let SocketEvent::Ip(ip) = event {
                sink.borrow_mut().push(label(ip));
            }
        });
        seen
    }

    fn feed(component: &Component, port: &str, packets: Vec<Packet>) {
        let port = component.in_port(port).unwrap();
        for packet in packets {
            port.handle_ip(packet, 0).unwrap();
        }
    }

    /// Echoes every data packet after a delay drawn from `delays`
    fn delayed_echo(scheduler: &Scheduler, delays: impl FnMut() -> u64 + 'static) -> Rc<Component> {
        let scheduler = scheduler.clone();
        let delays = RefCell::new(delays);
        Component::new(
            ComponentConfig::new()
                .inport("in", InPortConfig::new())
                .outport("out", OutPortConfig::new())
                .ordered(true)
                .process(move |input, output| {
                    if !input.has_data(&["in"])? {
                        return Ok(());
                    }
                    let data = input.get_data("in")?.unwrap_or_default();
                    let delay = {
                        let mut next = delays.borrow_mut();
                        (&mut *next)()
                    };
                    let output = output.clone();
                    scheduler.schedule(delay, move || output.send_done("out", data));
                    Ok(())
                }),
        )
        .unwrap()
    }

    #[test]
    fn test_brackets_from_two_inports_are_forwarded_once() {
        init_logging();
        let component = Component::new(
            ComponentConfig::new()
                .inport("a", InPortConfig::new())
                .inport("b", InPortConfig::new())
                .outport("out", OutPortConfig::new())
                .forward("a", &["out"])
                .forward("b", &["out"])
                .process(|input, output| {
                    if !input.has_data(&["a", "b"])? {
                        return Ok(());
                    }
                    let values = input.get_data_many(&["a", "b"])?;
                    let sum: i64 = values.iter().flatten().filter_map(Value::as_i64).sum();
                    output.send_done("out", sum)
                }),
        )
        .unwrap();
        let seen = capture(&component, "out");

        feed(&component, "a", vec![Packet::open_bracket("g")]);
        feed(&component, "b", vec![Packet::open_bracket("g")]);
        feed(&component, "a", vec![Packet::data(1)]);
        feed(&component, "b", vec![Packet::data(2)]);
        feed(&component, "a", vec![Packet::close_bracket("g")]);
        feed(&component, "b", vec![Packet::close_bracket("g")]);

        assert_eq!(*seen.borrow(), vec!["<g", "3", ">g"]);
        assert_eq!(component.load(), 0);
        assert_eq!(component.bracket_depth(BracketSide::Out, "out", None, None), 0);
    }

    #[test]
    fn test_addressable_outport_gets_brackets_per_index() {
        init_logging();
        let component = Component::new(
            ComponentConfig::new()
                .inport("in", InPortConfig::new())
                .outport("out", OutPortConfig::new().addressable())
                .process(|input, output| {
                    if !input.has_data(&["in"])? {
                        return Ok(());
                    }
                    let data = input.get_data("in")?.unwrap_or_default();
                    output.send(("out", 0), data.clone())?;
                    output.send_done(("out", 1), data)
                }),
        )
        .unwrap();
        let slots: Vec<Rc<RefCell<Vec<String>>>> = (0..2)
            .map(|idx| {
                let socket = Socket::new(Value::Null);
                component
                    .out_port("out")
                    .unwrap()
                    .attach(&socket, Some(idx))
                    .unwrap();
                let seen = Rc::new(RefCell::new(Vec::new()));
                let sink = seen.clone();
                socket.events().subscribe("ip", move |event| {
                    if let SocketEvent::Ip(ip) = event {
                        sink.borrow_mut().push(label(ip));
                    }
                });
                seen
            })
            .collect();

        feed(
            &component,
            "in",
            vec![
                Packet::open_bracket("a"),
                Packet::data(1),
                Packet::data(2),
                Packet::close_bracket("a"),
            ],
        );
        for slot in &slots {
            assert_eq!(*slot.borrow(), vec!["<a", "1", "2", ">a"]);
        }
        for idx in 0..2 {
            assert_eq!(component.bracket_depth(BracketSide::Out, "out", None, Some(idx)), 0);
        }
        assert_eq!(component.load(), 0);
    }

    #[test]
    fn test_scopes_keep_separate_bracket_stacks() {
        init_logging();
        let component = Component::new(
            ComponentConfig::new()
                .inport("in", InPortConfig::new())
                .outport("out", OutPortConfig::new())
                .process(|input, output| {
                    if !input.has_data(&["in"])? {
                        return Ok(());
                    }
                    let data = input.get_data("in")?.unwrap_or_default();
                    output.send_done("out", data)
                }),
        )
        .unwrap();
        let socket = Socket::new(Value::Null);
        component.out_port("out").unwrap().attach(&socket, None).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        socket.events().subscribe("ip", move |event| {
            if let SocketEvent::Ip(ip) = event {
                sink.borrow_mut()
                    .push(format!("{}:{}", ip.scope.clone().unwrap_or_default(), label(ip)));
            }
        });

        feed(
            &component,
            "in",
            vec![
                Packet::open_bracket("x").with_scope("s1"),
                Packet::open_bracket("y").with_scope("s2"),
                Packet::data(1).with_scope("s1"),
                Packet::data(2).with_scope("s2"),
                Packet::close_bracket("y").with_scope("s2"),
                Packet::close_bracket("x").with_scope("s1"),
            ],
        );
        assert_eq!(
            *seen.borrow(),
            vec!["s1:<x", "s1:1", "s2:<y", "s2:2", "s2:>y", "s1:>x"]
        );
    }

    #[test]
    fn test_delayed_completions_keep_brackets_around_their_data() {
        init_logging();
        let scheduler = Scheduler::new();
        // Second packet completes first
        let mut delays = vec![30u64, 10].into_iter();
        let component = delayed_echo(&scheduler, move || delays.next().unwrap_or(1));
        let seen = capture(&component, "out");

        feed(
            &component,
            "in",
            vec![
                Packet::open_bracket("a"),
                Packet::data(1),
                Packet::data(2),
                Packet::close_bracket("a"),
            ],
        );
        assert!(seen.borrow().is_empty());
        assert_eq!(component.load(), 2);

        scheduler.advance_by(10).unwrap();
        assert!(seen.borrow().is_empty());
        scheduler.run_until_idle().unwrap();
        assert_eq!(*seen.borrow(), vec!["<a", "1", "2", ">a"]);
        assert_eq!(component.load(), 0);
        assert_eq!(component.output_queue_len(), 0);
    }

    enum Item {
        Data(i64),
        Group(String, Vec<Item>),
    }

    fn generate(rng: &mut StdRng, depth: usize, counter: &mut usize, values: &mut i64) -> Vec<Item> {
        let count = rng.gen_range(1..=3);
        (0..count)
            .map(|_| {
                if depth < 3 && rng.gen_bool(0.35) {
                    *counter += 1;
                    let name = format!("g{}", counter);
                    Item::Group(name, generate(rng, depth + 1, counter, values))
                } else {
                    *values += 1;
                    Item::Data(*values)
                }
            })
            .collect()
    }

    fn flatten(items: &[Item], packets: &mut Vec<Packet>) {
        for item in items {
            match item {
                Item::Data(value) => packets.push(Packet::data(*value)),
                Item::Group(name, children) => {
                    packets.push(Packet::open_bracket(name.as_str()));
                    flatten(children, packets);
                    packets.push(Packet::close_bracket(name.as_str()));
                }
            }
        }
    }

    #[test]
    fn test_random_nested_streams_stay_balanced() {
        init_logging();
        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut counter = 0;
            let mut values = 0;
            let items = generate(&mut rng, 0, &mut counter, &mut values);
            let mut packets = Vec::new();
            flatten(&items, &mut packets);
            let expected: Vec<String> = packets.iter().map(label).collect();

            let scheduler = Scheduler::new();
            let mut latency = StdRng::seed_from_u64(seed + 100);
            let component = delayed_echo(&scheduler, move || latency.gen_range(1..50u64));
            let seen = capture(&component, "out");
            feed(&component, "in", packets);
            scheduler.run_until_idle().unwrap();

            assert_eq!(*seen.borrow(), expected, "seed {}", seed);
            assert_eq!(component.load(), 0);
        }
    }

    #[test]
    fn test_error_port_receives_forwarded_brackets() {
        init_logging();
        let component = Component::new(
            ComponentConfig::new()
                .inport("in", InPortConfig::new())
                .outport("out", OutPortConfig::new())
                .outport("error", OutPortConfig::new())
                .process(|input, output| {
                    if !input.has_data(&["in"])? {
                        return Ok(());
                    }
                    let data = input.get_data("in")?.unwrap_or_default();
                    if data == json!("bad") {
                        return output.done(Some(crate::core::errors::FlowError::component("rejected")));
                    }
                    output.send_done("out", data)
                }),
        )
        .unwrap();
        let out = capture(&component, "out");
        let errors = capture(&component, "error");
        feed(
            &component,
            "in",
            vec![
                Packet::open_bracket("batch"),
                Packet::data("ok"),
                Packet::data("bad"),
                Packet::close_bracket("batch"),
            ],
        );
        assert_eq!(*out.borrow(), vec!["<batch", "\"ok\"", ">batch"]);
        assert_eq!(*errors.borrow(), vec!["<batch", "\"rejected\"", ">batch"]);
    }
}
