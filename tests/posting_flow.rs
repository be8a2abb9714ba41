mod common;

use common::{amount, date, setup_test_env, transfer};
use ledger_engine::{
    api::{AccountSelector, JournalLineRequest, LedgerQuery},
    core::services::AccountChanges,
    errors::{AccountRejection, ValidationError},
    ledger::{AccountNature, JournalStatus},
    LedgerError,
};
use rust_decimal::Decimal;

#[test]
fn cash_sale_scenario_balances() {
    let env = setup_test_env(date(2024, 1, 31));
    let cash = env.account("1000", "Cash", AccountNature::Asset);
    let revenue = env.account("4000", "Revenue", AccountNature::Income);

    let posted = env
        .manager
        .post_journal_entry(transfer(date(2024, 1, 15), "1000", "4000", "1000"))
        .expect("post sale");
    assert_eq!(posted.status, JournalStatus::Posted);

    assert_eq!(
        env.manager.get_balance(cash.id, None).unwrap(),
        amount("1000")
    );
    assert_eq!(
        env.manager.get_balance(revenue.id, None).unwrap(),
        amount("1000")
    );

    let report = env.manager.trial_balance(Some(date(2024, 1, 31))).unwrap();
    assert_eq!(report.total_debits, amount("1000"));
    assert_eq!(report.total_credits, amount("1000"));
    assert!(report.balanced);
}

#[test]
fn unbalanced_entry_is_rejected_before_any_mutation() {
    let env = setup_test_env(date(2024, 1, 31));
    let cash = env.account("1000", "Cash", AccountNature::Asset);
    env.account("4000", "Revenue", AccountNature::Income);

    let mut request = transfer(date(2024, 1, 15), "1000", "4000", "100");
    request.lines[1].credit = Some(amount("99.50"));
    let err = env.manager.post_journal_entry(request).unwrap_err();
    match err {
        LedgerError::Validation(ValidationError::UnbalancedEntry { difference }) => {
            assert_eq!(difference, amount("0.50"));
        }
        other => panic!("expected unbalanced entry, got {other:?}"),
    }

    assert_eq!(env.manager.account(cash.id).unwrap().current_balance, Decimal::ZERO);
    assert!(env
        .manager
        .account_statement(cash.id, LedgerQuery::default())
        .unwrap()
        .lines
        .is_empty());
}

#[test]
fn drift_below_a_cent_is_accepted() {
    let env = setup_test_env(date(2024, 1, 31));
    env.account("1000", "Cash", AccountNature::Asset);
    env.account("4000", "Revenue", AccountNature::Income);
    let mut request = transfer(date(2024, 1, 15), "1000", "4000", "10.00");
    request.lines[1].credit = Some(amount("10.004"));
    env.manager.post_journal_entry(request).expect("within tolerance");
    assert!(env.manager.trial_balance(None).unwrap().balanced);
}

#[test]
fn inactive_and_group_accounts_refuse_postings() {
    let env = setup_test_env(date(2024, 1, 31));
    let cash = env.account("1000", "Cash", AccountNature::Asset);
    env.account("4000", "Revenue", AccountNature::Income);
    env.manager
        .update_account(
            cash.id,
            AccountChanges {
                active: Some(false),
                ..AccountChanges::default()
            },
        )
        .unwrap();

    let err = env
        .manager
        .post_journal_entry(transfer(date(2024, 1, 2), "1000", "4000", "5"))
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Validation(ValidationError::InvalidAccountReference {
            line: 0,
            reason: AccountRejection::Inactive,
            ..
        })
    ));

    let mut request = transfer(date(2024, 1, 2), "4000", "4000", "5");
    request.lines.push(JournalLineRequest {
        account: AccountSelector::Code("9999".into()),
        debit: Some(amount("1")),
        credit: None,
        description: String::new(),
        cost_center: None,
    });
    let err = env.manager.post_journal_entry(request).unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[test]
fn reversal_swaps_sides_and_restores_balances() {
    let env = setup_test_env(date(2024, 3, 31));
    let cash = env.account("1000", "Cash", AccountNature::Asset);
    let revenue = env.account("4000", "Revenue", AccountNature::Income);
    let original = env
        .manager
        .post_journal_entry(transfer(date(2024, 3, 1), "1000", "4000", "400"))
        .unwrap();
    let rows_before = env
        .manager
        .account_statement(cash.id, LedgerQuery::default())
        .unwrap()
        .lines;

    let reversal = env
        .manager
        .reverse_entry(original.id, Some(date(2024, 3, 5)), "auditor")
        .unwrap();
    assert_eq!(reversal.date, date(2024, 3, 5));
    assert_eq!(reversal.lines[0].debit, original.lines[0].credit);
    assert_eq!(reversal.lines[0].credit, original.lines[0].debit);
    assert_eq!(reversal.reverses, Some(original.id));

    let stored = env.manager.journal_entry(original.id).unwrap();
    assert_eq!(stored.status, JournalStatus::Reversed);
    assert_eq!(env.manager.get_balance(cash.id, None).unwrap(), Decimal::ZERO);
    assert_eq!(env.manager.get_balance(revenue.id, None).unwrap(), Decimal::ZERO);

    let rows_after = env
        .manager
        .account_statement(cash.id, LedgerQuery::default())
        .unwrap()
        .lines;
    assert_eq!(rows_after.len(), 2);
    assert_eq!(rows_after[0], rows_before[0]);

    let err = env
        .manager
        .reverse_entry(original.id, None, "auditor")
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));
}

#[test]
fn balances_always_match_ledger_replay() {
    let env = setup_test_env(date(2024, 12, 31));
    env.account("1000", "Cash", AccountNature::Asset);
    env.account("2000", "Payables", AccountNature::Liability);
    env.account("3000", "Capital", AccountNature::Equity);
    env.account("4000", "Revenue", AccountNature::Income);
    env.account("6000", "Supplies", AccountNature::Expense);

    let pairs = [
        ("1000", "3000"),
        ("6000", "2000"),
        ("1000", "4000"),
        ("2000", "1000"),
        ("6000", "1000"),
    ];
    let mut posted = Vec::new();
    for step in 0..40u32 {
        let (debit, credit) = pairs[(step as usize * 7) % pairs.len()];
        let day = date(2024, 1 + step % 12, 1 + (step * 5) % 28);
        let value = format!("{}.{:02}", 10 + step * 13 % 97, step * 17 % 100);
        let entry = env
            .manager
            .post_journal_entry(transfer(day, debit, credit, &value))
            .unwrap();
        posted.push(entry.id);
        if step % 9 == 8 {
            env.manager
                .reverse_entry(posted[posted.len() / 2], None, "auditor")
                .ok();
        }
    }

    assert!(env.manager.verify_integrity().is_clean());
    for account in env.manager.accounts() {
        let replayed = env
            .manager
            .get_balance(account.id, Some(date(2100, 1, 1)))
            .unwrap();
        assert_eq!(replayed, account.current_balance, "account {}", account.code);
    }
    assert!(env.manager.trial_balance(Some(date(2100, 1, 1))).unwrap().balanced);
}

#[test]
fn statement_window_reports_opening_and_closing() {
    let env = setup_test_env(date(2024, 6, 30));
    let cash = env.account("1000", "Cash", AccountNature::Asset);
    env.account("3000", "Capital", AccountNature::Equity);
    for (day, value) in [(date(2024, 1, 10), "100"), (date(2024, 2, 10), "50"), (date(2024, 3, 10), "25")] {
        env.manager
            .post_journal_entry(transfer(day, "1000", "3000", value))
            .unwrap();
    }

    let statement = env
        .manager
        .account_statement(
            cash.id,
            LedgerQuery {
                from: Some(date(2024, 2, 1)),
                to: Some(date(2024, 2, 28)),
            },
        )
        .unwrap();
    assert_eq!(statement.opening_balance, amount("100"));
    assert_eq!(statement.lines.len(), 1);
    assert_eq!(statement.closing_balance, amount("150"));
}
