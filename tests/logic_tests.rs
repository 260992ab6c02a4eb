use hvacd::cache::BoardStateCache;
use hvacd::config::*;
use hvacd::payload::BoardCommand;
use hvacd::rules::*;
use hvacd::threads::logic::ControlLoop;

const CONFIG: &str = include_str!("../hvac.example.json");

fn load() -> (Configurator, BoardStateCache) {
    let (_, config) = Configurator::from_json(CONFIG).unwrap();
    let cache = BoardStateCache::from_config(&config);
    (config, cache)
}

fn heat_only(config: &Configurator) -> Vec<SetPoint> {
    vec![config.set_point("zone1_heat").unwrap()]
}

#[test]
fn test_example_configuration_loads() {
    let (settings, config) = Configurator::from_json(CONFIG).unwrap();
    assert_eq!(settings.listener.address, "unix:///tmp/bbb_hvac");
    assert_eq!(config.points().count(), 7);
    assert_eq!(config.set_points().len(), 2);
    assert_eq!(
        config.set_point("zone1_cool").unwrap().outputs,
        ["ac_comp", "air_handler"]
    );
}

#[test]
fn test_heating_hysteresis_cycle() {
    let (config, cache) = load();
    let set_points = heat_only(&config);
    let mut control = ControlLoop::new();

    // Cold zone turns the heater on
    cache.update("space_temp", 20.0, 1);
    let outcome = control.evaluate_tick(&cache.read_all(), &set_points);
    assert_eq!(outcome.commands, [BoardCommand::new("heater", ON)]);

    // Same conditions do not repeat the command
    let outcome = control.evaluate_tick(&cache.read_all(), &set_points);
    assert!(outcome.commands.is_empty());

    // Above target + hysteresis turns it off
    cache.update("space_temp", 21.5, 2);
    let outcome = control.evaluate_tick(&cache.read_all(), &set_points);
    assert_eq!(outcome.commands, [BoardCommand::new("heater", OFF)]);

    // Inside the band nothing changes
    cache.update("space_temp", 21.2, 3);
    let outcome = control.evaluate_tick(&cache.read_all(), &set_points);
    assert!(outcome.commands.is_empty());
    assert!(outcome.errors.is_empty());
    assert_eq!(control.last_commanded("heater"), Some(OFF));
}

#[test]
fn test_band_edges_are_inclusive() {
    let (config, _) = load();
    let heat = config.set_point("zone1_heat").unwrap();

    assert_eq!(heat.rule.decide(21.0, 20.5), Decision::Drive(ON));
    assert_eq!(heat.rule.decide(21.0, 21.5), Decision::Drive(OFF));
    assert_eq!(heat.rule.decide(21.0, 20.51), Decision::Hold);
}

#[test]
fn test_cooling_drives_every_output() {
    let (config, cache) = load();
    let set_points = config.set_points();
    let mut control = ControlLoop::new();

    cache.update("space_temp", 26.0, 1);
    let outcome = control.evaluate_tick(&cache.read_all(), &set_points);

    // Heat rule turns the heater off, cool rule turns both cooling outputs on
    assert!(outcome.commands.contains(&BoardCommand::new("heater", OFF)));
    assert!(outcome.commands.contains(&BoardCommand::new("ac_comp", ON)));
    assert!(outcome.commands.contains(&BoardCommand::new("air_handler", ON)));
    assert_eq!(outcome.commands.len(), 3);
}

#[test]
fn test_missing_input_is_reported_not_fatal() {
    let (config, cache) = load();
    let mut control = ControlLoop::new();

    let outcome = control.evaluate_tick(&cache.read_all(), &config.set_points());
    assert!(outcome.commands.is_empty());
    assert_eq!(outcome.errors.len(), 2);
    assert!(matches!(
        outcome.errors[0],
        RuleEvaluationError::MissingInput { .. }
    ));
}

#[test]
fn test_forced_input_drives_the_rule() {
    let (config, cache) = load();
    let set_points = heat_only(&config);
    let mut control = ControlLoop::new();

    cache.update("space_temp", 22.0, 1);
    cache.force("space_temp", 15.0).unwrap();
    cache.update("space_temp", 22.0, 2);

    let outcome = control.evaluate_tick(&cache.read_all(), &set_points);
    assert_eq!(outcome.commands, [BoardCommand::new("heater", ON)]);
}

#[test]
fn test_target_change_applies_next_tick() {
    let (config, cache) = load();
    let mut control = ControlLoop::new();
    cache.update("space_temp", 21.0, 1);

    let outcome = control.evaluate_tick(&cache.read_all(), &heat_only(&config));
    assert!(outcome.commands.is_empty());

    config.update_target("zone1_heat", 23.0).unwrap();
    let outcome = control.evaluate_tick(&cache.read_all(), &heat_only(&config));
    assert_eq!(outcome.commands, [BoardCommand::new("heater", ON)]);
}

#[test]
fn test_track_rule_deadband() {
    let rule = ControlRule::Track { deadband: 0.2 };
    assert_eq!(rule.decide(50.0, 50.1), Decision::Hold);
    assert_eq!(rule.decide(50.0, 49.5), Decision::Drive(50.0));
}
