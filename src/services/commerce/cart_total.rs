use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::AppConfig;
use crate::entities::commerce::ProductModel;
use crate::money::{Currency, Money, MoneyError};

/// A cart line joined with the live product row it points at.
#[derive(Debug, Clone, PartialEq)]
pub struct CartLine {
    pub product: ProductModel,
    pub quantity: i32,
}

impl CartLine {
    pub fn line_total(&self) -> Result<Money, MoneyError> {
        let unit = Money::exact(
            self.product.effective_price(),
            Currency::new(&self.product.currency)?,
        );
        Ok(unit.multiply(Decimal::from(self.quantity)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CartTotal {
    pub subtotal: Money,
    pub shipping: Money,
    pub tax: Money,
    pub total: Money,
}

/// Computes cart totals from live product prices.
///
/// Lines are summed exactly, the subtotal is rounded half-up to the
/// currency's minor unit, and VAT is taken on the rounded subtotal.
/// Shipping is always zero.
#[derive(Debug, Clone)]
pub struct CartTotalCalculator {
    vat_rate: Decimal,
    fallback_currency: Currency,
}

impl CartTotalCalculator {
    pub fn new(vat_rate: Decimal, fallback_currency: Currency) -> Self {
        Self {
            vat_rate,
            fallback_currency,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, MoneyError> {
        Ok(Self::new(
            config.vat_rate,
            Currency::new(&config.default_currency)?,
        ))
    }

    pub fn vat_rate(&self) -> Decimal {
        self.vat_rate
    }

    pub fn calculate(&self, lines: &[CartLine]) -> Result<CartTotal, MoneyError> {
        let currency = match lines.first() {
            Some(line) => Currency::new(&line.product.currency)?,
            None => self.fallback_currency.clone(),
        };

        let mut subtotal = Money::exact(Decimal::ZERO, currency.clone());
        for line in lines {
            subtotal = subtotal.checked_add(&line.line_total()?)?;
        }
        let subtotal = subtotal.round_half_up();

        let shipping = Money::zero(currency);
        let tax = subtotal.multiply(self.vat_rate).round_half_up();
        let total = subtotal.checked_add(&shipping)?.checked_add(&tax)?;

        Ok(CartTotal {
            subtotal,
            shipping,
            tax,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn product(price: Decimal, sale_price: Option<Decimal>, currency: &str) -> ProductModel {
        ProductModel {
            id: Uuid::new_v4(),
            name: "Item".into(),
            sku: Uuid::new_v4().to_string(),
            category: None,
            price,
            sale_price,
            currency: currency.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn line(price: Decimal, sale_price: Option<Decimal>, quantity: i32) -> CartLine {
        CartLine {
            product: product(price, sale_price, "SAR"),
            quantity,
        }
    }

    fn calculator() -> CartTotalCalculator {
        CartTotalCalculator::new(dec!(0.15), Currency::new("SAR").unwrap())
    }

    #[test]
    fn regular_prices() {
        let totals = calculator()
            .calculate(&[line(dec!(100), None, 2), line(dec!(200), None, 1)])
            .unwrap();
        assert_eq!(totals.subtotal.amount(), dec!(400.00));
        assert_eq!(totals.tax.amount(), dec!(60.00));
        assert_eq!(totals.shipping.amount(), dec!(0));
        assert_eq!(totals.total.amount(), dec!(460.00));
    }

    #[test]
    fn sale_price_takes_precedence() {
        let totals = calculator()
            .calculate(&[line(dec!(100), Some(dec!(80)), 2), line(dec!(200), None, 1)])
            .unwrap();
        assert_eq!(totals.subtotal.amount(), dec!(360.00));
        assert_eq!(totals.tax.amount(), dec!(54.00));
        assert_eq!(totals.total.amount(), dec!(414.00));
    }

    #[test]
    fn mixed_sale_and_regular_lines() {
        let totals = calculator()
            .calculate(&[line(dec!(100), None, 2), line(dec!(200), Some(dec!(150)), 1)])
            .unwrap();
        assert_eq!(totals.subtotal.amount(), dec!(350.00));
        assert_eq!(totals.tax.amount(), dec!(52.50));
        assert_eq!(totals.total.amount(), dec!(402.50));
    }

    #[test]
    fn empty_cart_is_zero_in_fallback_currency() {
        let totals = calculator().calculate(&[]).unwrap();
        for money in [&totals.subtotal, &totals.shipping, &totals.tax, &totals.total] {
            assert!(money.is_zero());
            assert_eq!(money.currency().code(), "SAR");
        }
    }

    #[test]
    fn currency_comes_from_first_line() {
        let lines = [CartLine {
            product: product(dec!(10), None, "AED"),
            quantity: 1,
        }];
        let totals = calculator().calculate(&lines).unwrap();
        assert_eq!(totals.total.currency().code(), "AED");
    }

    #[test]
    fn mixed_currencies_are_rejected() {
        let lines = [
            CartLine {
                product: product(dec!(10), None, "AED"),
                quantity: 1,
            },
            line(dec!(10), None, 1),
        ];
        assert!(calculator().calculate(&lines).is_err());
    }

    #[test]
    fn tax_rounds_half_up_after_exact_sum() {
        // 3 x 0.03 = 0.09 exact; tax 0.0135 -> 0.01
        let totals = calculator()
            .calculate(&[line(dec!(0.03), None, 3)])
            .unwrap();
        assert_eq!(totals.subtotal.amount(), dec!(0.09));
        assert_eq!(totals.tax.amount(), dec!(0.01));

        // 0.10 -> tax 0.015 -> 0.02
        let totals = calculator().calculate(&[line(dec!(0.10), None, 1)]).unwrap();
        assert_eq!(totals.tax.amount(), dec!(0.02));
    }

    proptest! {
        #[test]
        fn total_is_sum_of_parts(
            items in prop::collection::vec((1i64..100_000, prop::option::of(1i64..100_000), 1i32..20), 0..8)
        ) {
            let lines: Vec<CartLine> = items
                .into_iter()
                .map(|(price, sale, qty)| {
                    line(Decimal::new(price, 2), sale.map(|s| Decimal::new(s, 2)), qty)
                })
                .collect();
            let totals = calculator().calculate(&lines).unwrap();

            let expected_tax = Money::of(totals.subtotal.amount() * dec!(0.15), Currency::new("SAR").unwrap());
            prop_assert_eq!(totals.tax.amount(), expected_tax.amount());
            prop_assert_eq!(
                totals.total.amount(),
                totals.subtotal.amount() + totals.shipping.amount() + totals.tax.amount()
            );
        }
    }
}
