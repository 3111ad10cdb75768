use super::{to_number, Allele, GeneError, GeneSpec, Momentum, NumberSpec, PowerSpec, SetSpec};
use rand::{rngs::StdRng, SeedableRng};
use serde_yaml::Value;

fn number(positive: bool, avoid_zero: bool) -> GeneSpec {
    GeneSpec::Number(NumberSpec {
        avoid_zero,
        positive,
        min_order: -3,
        max_order: 3,
        precision: 1,
    })
}

#[test]
pub fn number_value_is_digit_times_power_of_ten() {
    for digit in -9..=9 {
        for order in -3..=3 {
            let allele = Allele::Number { digit, order };
            let expected = digit as f64 * 10f64.powi(order);

            assert!((to_number(digit, order) - expected).abs() < 1e-12);
            let expressed = allele.express().as_f64().unwrap();
            assert!((expressed - expected).abs() < 1e-9, "{digit}e{order}");
        }
    }
}

#[test]
pub fn positive_orders_express_as_integers() {
    let allele = Allele::Number { digit: 3, order: 2 };

    assert_eq!(allele.express(), Value::from(300));
}

#[test]
pub fn mutated_numbers_stay_within_bounds() {
    let mut rng = StdRng::seed_from_u64(7);

    for (positive, avoid_zero) in [(true, true), (true, false), (false, true), (false, false)] {
        let spec = number(positive, avoid_zero);
        let mut allele = spec.sample(&mut rng);
        spec.check(&allele).unwrap();

        for _ in 0..500 {
            let (next, momentum) = spec.mutate(&allele, None, &mut rng);
            spec.check(&next).unwrap();
            assert!(momentum.is_some());
            assert_ne!(next, allele);
            allele = next;
        }
    }
}

#[test]
pub fn momentum_repeats_the_previous_move() {
    let mut rng = StdRng::seed_from_u64(1);
    let spec = number(true, true);
    let allele = Allele::Number { digit: 2, order: 0 };

    for _ in 0..50 {
        let (next, momentum) = spec.mutate(&allele, Some(Momentum::IncreaseOrder), &mut rng);
        assert_eq!(next, Allele::Number { digit: 2, order: 1 });
        assert_eq!(momentum, Some(Momentum::IncreaseOrder));
    }
}

#[test]
pub fn avoid_zero_steps_over_zero() {
    let mut rng = StdRng::seed_from_u64(3);
    let spec = GeneSpec::Number(NumberSpec {
        avoid_zero: true,
        positive: false,
        min_order: 0,
        max_order: 0,
        precision: 1,
    });

    let (next, _) = spec.mutate(&Allele::Number { digit: -1, order: 0 }, Some(Momentum::IncreaseDigit), &mut rng);
    assert_eq!(next, Allele::Number { digit: 1, order: 0 });
}

#[test]
pub fn decode_rejects_invalid_numbers() {
    let spec = number(true, true);

    assert_eq!(
        spec.decode(&serde_yaml::from_str("[0, 1]").unwrap()),
        Err(GeneError::Zero)
    );
    assert_eq!(
        spec.decode(&serde_yaml::from_str("[-2, 1]").unwrap()),
        Err(GeneError::Negative(-2))
    );
    assert!(matches!(
        spec.decode(&serde_yaml::from_str("[2, 9]").unwrap()),
        Err(GeneError::OrderOutOfRange { .. })
    ));
    assert!(matches!(
        spec.decode(&Value::from(4)),
        Err(GeneError::MalformedNumber(_))
    ));
    assert_eq!(
        spec.decode(&serde_yaml::from_str("[4, -2]").unwrap()),
        Ok(Allele::Number { digit: 4, order: -2 })
    );
}

#[test]
pub fn powers_of_two_move_by_one_step() {
    let mut rng = StdRng::seed_from_u64(11);
    let spec = GeneSpec::PowerOfTwo(PowerSpec {
        min_power: 2,
        max_power: 6,
    });
    let mut power = 4;

    for _ in 0..200 {
        let (next, _) = spec.mutate(&Allele::PowerOfTwo { power }, None, &mut rng);
        let Allele::PowerOfTwo { power: next } = next else {
            panic!("kind changed");
        };
        assert_eq!((next as i64 - power as i64).abs(), 1);
        assert!((2..=6).contains(&next));
        power = next;
    }

    let (floor, momentum) = spec.mutate(&Allele::PowerOfTwo { power: 2 }, Some(Momentum::HalvePower), &mut rng);
    assert_eq!(floor, Allele::PowerOfTwo { power: 3 });
    assert_eq!(momentum, Some(Momentum::DoublePower));
}

#[test]
pub fn power_of_two_round_trips_through_its_value() {
    let spec = GeneSpec::PowerOfTwo(PowerSpec {
        min_power: 0,
        max_power: 10,
    });

    assert_eq!(
        spec.decode(&Value::from(64)),
        Ok(Allele::PowerOfTwo { power: 6 })
    );
    assert_eq!(Allele::PowerOfTwo { power: 6 }.to_value(), Value::from(64));
    assert!(matches!(
        spec.decode(&Value::from(48)),
        Err(GeneError::NotPowerOfTwo(_))
    ));
}

#[test]
pub fn set_mutation_never_keeps_the_current_member() {
    let mut rng = StdRng::seed_from_u64(5);
    let spec = GeneSpec::Set(SetSpec {
        domain: vec![Value::from("foo"), Value::from("bar"), Value::from("baz")],
    });
    let current = Allele::Member(Value::from("foo"));

    for _ in 0..100 {
        let (next, _) = spec.mutate(&current, None, &mut rng);
        assert_ne!(next, current);
        spec.check(&next).unwrap();
    }
}

#[test]
pub fn singleton_set_keeps_its_value() {
    let mut rng = StdRng::seed_from_u64(5);
    let spec = GeneSpec::Set(SetSpec {
        domain: vec![Value::from("only")],
    });
    let current = Allele::Member(Value::from("only"));

    assert_eq!(spec.mutate(&current, None, &mut rng).0, current);
}

#[test]
pub fn repeated_set_members_are_rejected() {
    let spec = GeneSpec::Set(SetSpec {
        domain: vec![Value::from("a"), Value::from("b"), Value::from("a")],
    });

    assert!(matches!(spec.validate(), Err(GeneError::InvalidSpec(_))));
}

#[test]
pub fn specs_parse_from_tagged_templates() {
    let spec: GeneSpec = serde_yaml::from_str("gtype: number\nmin_order: -2\nprecision: 2").unwrap();

    assert_eq!(
        spec,
        GeneSpec::Number(NumberSpec {
            avoid_zero: true,
            positive: true,
            min_order: -2,
            max_order: 5,
            precision: 2,
        })
    );

    let spec: GeneSpec = serde_yaml::from_str("gtype: ptwo\nmax_power: 4").unwrap();
    assert_eq!(
        spec,
        GeneSpec::PowerOfTwo(PowerSpec {
            min_power: 0,
            max_power: 4
        })
    );
    assert!(GeneSpec::Set(SetSpec { domain: vec![] }).validate().is_err());
}
